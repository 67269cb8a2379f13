use super::{scheduling::scheduler_yield_and_die, system_mut};
use crate::preemption;
use log::{debug, error};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

/// A function that may be used for thread creation.
///
/// Arguments are passed by capturing them.
pub type ThreadFunction = Box<dyn FnOnce() + 'static>;

/// A function to safely close the current thread.
/// This is safe to call at any point in a thread's runtime.
///
/// # Panics
/// When called outside a running thread system, or from the thread that
/// called `run`.
pub fn exit_thread() -> ! {
    // SAFETY: Only the thread system of this carrier is touched, and nothing
    // is mutated before preemption is disabled below.
    let tid = match unsafe { system_mut() } {
        None => panic!("exit called outside of a running thread system"),
        Some(system) if system.running.is_idle() => panic!("the idle thread cannot exit"),
        Some(system) => system.running.tid(),
    };

    preemption::disable();
    debug!("thread {tid} exiting");
    scheduler_yield_and_die();
}

fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// A wrapper function to execute a thread's true function.
///
/// Every new context starts here, with preemption disabled.
pub(super) extern "C" fn run_thread() {
    // SAFETY: The tick is masked until the `enable` below.
    let (tid, entry) = match unsafe { system_mut() } {
        Some(system) => (system.running.tid(), system.running.take_entry()),
        None => panic!("thread started without a thread system"),
    };

    // Our scheduler will operate without preemption.
    // Every new thread should start with it enabled.
    preemption::enable();

    if let Some(entry) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            error!("thread {tid} panicked: {}", describe_panic(&*payload));
        }
    }

    // Safely exit the thread.
    exit_thread();
}
