//! C interface to the uthread runtime.
//!
//! Every fallible call returns `0` on success and `-1` on failure, and null
//! handles are rejected at the boundary. `cbindgen` writes the matching
//! header to `include/uthread.h` at build time.

use core::{fmt, ptr};
use libc::{c_int, c_void};
use log::debug;
use uthread::{threading::thread_control_block::ThreadControlBlock, Queue, Semaphore, ThreadRef};

/// A thread as seen from C.
pub struct UthreadTcb {
    _private: [u8; 0],
}

/// Entry point of a thread, called with the `arg` given at creation.
pub type UthreadFunc = Option<unsafe extern "C" fn(arg: *mut c_void)>;

/// A queue of opaque pointers.
pub struct QueueHandle {
    items: Queue<*mut c_void>,
}

pub type QueuePtr = *mut QueueHandle;

/// Callback for `queue_iterate`, called with the queue and each item.
pub type QueueFunc = Option<unsafe extern "C" fn(queue: QueuePtr, data: *mut c_void)>;

/// A counting semaphore.
pub struct SemaphoreHandle {
    semaphore: Semaphore,
}

pub type SemPtr = *mut SemaphoreHandle;

fn status<E: fmt::Display>(operation: &str, result: Result<(), E>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            debug!("{operation} failed: {err}");
            -1
        }
    }
}

fn entry(func: unsafe extern "C" fn(*mut c_void), arg: *mut c_void) -> impl FnOnce() + 'static {
    // SAFETY: The caller of `uthread_run`/`uthread_create` vouches for
    // `func` and `arg`.
    move || unsafe { func(arg) }
}

/// Runs `func(arg)` as the first thread and returns once no thread is ready.
#[no_mangle]
pub extern "C" fn uthread_run(preempt: bool, func: UthreadFunc, arg: *mut c_void) -> c_int {
    let Some(func) = func else {
        return -1;
    };
    status("uthread_run", uthread::run(preempt, entry(func, arg)))
}

/// Creates a thread running `func(arg)`. Only valid inside `uthread_run`.
#[no_mangle]
pub extern "C" fn uthread_create(func: UthreadFunc, arg: *mut c_void) -> c_int {
    let Some(func) = func else {
        return -1;
    };
    status("uthread_create", uthread::create(entry(func, arg)).map(drop))
}

#[no_mangle]
pub extern "C" fn uthread_yield() {
    uthread::yield_now();
}

/// Terminates the calling thread.
#[no_mangle]
pub extern "C" fn uthread_exit() -> ! {
    uthread::exit()
}

#[no_mangle]
pub extern "C" fn uthread_block() {
    if let Err(err) = uthread::block() {
        debug!("uthread_block failed: {err}");
    }
}

/// # Safety
/// `uthread` must come from `uthread_current` and name a thread that has not
/// exited.
#[no_mangle]
pub unsafe extern "C" fn uthread_unblock(uthread: *mut UthreadTcb) {
    if uthread.is_null() {
        return;
    }

    let thread = ThreadRef::from_ptr(uthread.cast_const().cast::<ThreadControlBlock>());
    if let Err(err) = uthread::unblock(&thread) {
        debug!("uthread_unblock failed: {err}");
    }
}

/// The calling thread, or null outside `uthread_run`. The pointer stays valid
/// until that thread exits.
#[no_mangle]
pub extern "C" fn uthread_current() -> *mut UthreadTcb {
    uthread::current().map_or(ptr::null_mut(), |thread| {
        thread.as_ptr().cast_mut().cast::<UthreadTcb>()
    })
}

#[no_mangle]
pub extern "C" fn queue_create() -> QueuePtr {
    Box::into_raw(Box::new(QueueHandle {
        items: Queue::new(),
    }))
}

/// Frees an empty queue. Fails, and frees nothing, if the queue is null or
/// still holds items.
///
/// # Safety
/// `queue` must be null or come from `queue_create`.
#[no_mangle]
pub unsafe extern "C" fn queue_destroy(queue: QueuePtr) -> c_int {
    if queue.is_null() || !(*queue).items.is_empty() {
        return -1;
    }

    drop(Box::from_raw(queue));
    0
}

/// # Safety
/// `queue` must be null or come from `queue_create`.
#[no_mangle]
pub unsafe extern "C" fn queue_enqueue(queue: QueuePtr, data: *mut c_void) -> c_int {
    if queue.is_null() || data.is_null() {
        return -1;
    }
    status("queue_enqueue", (*queue).items.enqueue(data))
}

/// # Safety
/// `queue` must be null or come from `queue_create`, and `data` must be null
/// or writable.
#[no_mangle]
pub unsafe extern "C" fn queue_dequeue(queue: QueuePtr, data: *mut *mut c_void) -> c_int {
    if queue.is_null() || data.is_null() {
        return -1;
    }

    match (*queue).items.dequeue() {
        Ok(item) => {
            *data = item;
            0
        }
        Err(_) => -1,
    }
}

/// Removes the oldest occurrence of `data`.
///
/// # Safety
/// `queue` must be null or come from `queue_create`.
#[no_mangle]
pub unsafe extern "C" fn queue_delete(queue: QueuePtr, data: *mut c_void) -> c_int {
    if queue.is_null() || data.is_null() {
        return -1;
    }
    status("queue_delete", (*queue).items.delete(&data).map(drop))
}

/// Calls `func` on every item from oldest to newest. `func` may delete the
/// item it is given.
///
/// # Safety
/// `queue` must be null or come from `queue_create`.
#[no_mangle]
pub unsafe extern "C" fn queue_iterate(queue: QueuePtr, func: QueueFunc) -> c_int {
    let Some(func) = func else {
        return -1;
    };
    if queue.is_null() {
        return -1;
    }

    // No borrow of the queue is held across `func`, which may modify it
    // through `queue`.
    let mut cursor = (*queue).items.first();
    while let Some(at) = cursor {
        let Some(&item) = (*queue).items.get(at) else {
            break;
        };
        let next = (*queue).items.next_position(at);

        func(queue, item);

        cursor = next.filter(|&next| (*queue).items.get(next).is_some());
    }
    0
}

/// # Safety
/// `queue` must be null or come from `queue_create`.
#[no_mangle]
pub unsafe extern "C" fn queue_length(queue: QueuePtr) -> c_int {
    if queue.is_null() {
        return -1;
    }
    c_int::try_from((*queue).items.len()).unwrap_or(c_int::MAX)
}

#[no_mangle]
pub extern "C" fn sem_create(count: usize) -> SemPtr {
    Box::into_raw(Box::new(SemaphoreHandle {
        semaphore: Semaphore::new(count),
    }))
}

/// Frees a semaphore nobody is waiting on.
///
/// # Safety
/// `sem` must be null or come from `sem_create`.
#[no_mangle]
pub unsafe extern "C" fn sem_destroy(sem: SemPtr) -> c_int {
    if sem.is_null() || (*sem).semaphore.waiters() > 0 {
        return -1;
    }

    drop(Box::from_raw(sem));
    0
}

/// # Safety
/// `sem` must be null or come from `sem_create`.
#[no_mangle]
pub unsafe extern "C" fn sem_down(sem: SemPtr) -> c_int {
    if sem.is_null() {
        return -1;
    }
    status("sem_down", (*sem).semaphore.down())
}

/// # Safety
/// `sem` must be null or come from `sem_create`.
#[no_mangle]
pub unsafe extern "C" fn sem_up(sem: SemPtr) -> c_int {
    if sem.is_null() {
        return -1;
    }
    status("sem_up", (*sem).semaphore.up())
}
