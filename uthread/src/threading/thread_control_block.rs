use super::{
    context_switch::{Context, Stack},
    thread_functions::{run_thread, ThreadFunction},
};
use crate::error::Result;
use core::{
    cell::{Cell, UnsafeCell},
    fmt,
};
use std::rc::Rc;

pub type Tid = u64;

/// The idle thread stands for whoever called `run`.
pub const IDLE_TID: Tid = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ready,
    Running,
    Blocked,
    Exited,
}

pub struct ThreadControlBlock {
    tid: Tid,
    status: Cell<ThreadStatus>,
    context: UnsafeCell<Context>,
    // `None` for the idle thread, which lives on the caller's stack, and for
    // threads that have exited and been reaped.
    stack: Cell<Option<Stack>>,
    // Taken by `run_thread` the first time the thread is switched to.
    entry: Cell<Option<ThreadFunction>>,
}

impl ThreadControlBlock {
    pub fn create(tid: Tid, entry: ThreadFunction, stack_size: usize) -> Result<Self> {
        let mut stack = Stack::allocate(stack_size)?;
        let context = Context::new(&mut stack, run_thread)?;

        Ok(Self {
            tid,
            status: Cell::new(ThreadStatus::Ready),
            context: UnsafeCell::new(context),
            stack: Cell::new(Some(stack)),
            entry: Cell::new(Some(entry)),
        })
    }

    /// Creates the TCB for the flow of control that starts the runtime.
    ///
    /// Its context is filled in by the first switch away from it.
    pub fn create_idle_thread() -> Self {
        Self {
            tid: IDLE_TID,
            status: Cell::new(ThreadStatus::Running),
            context: UnsafeCell::new(Context::empty()),
            stack: Cell::new(None),
            entry: Cell::new(None),
        }
    }
}

/// A shared handle to a thread.
///
/// Handles compare equal only when they refer to the same thread.
#[derive(Clone)]
pub struct ThreadRef(Rc<ThreadControlBlock>);

impl ThreadRef {
    pub(crate) fn new(tcb: ThreadControlBlock) -> Self {
        Self(Rc::new(tcb))
    }

    pub fn tid(&self) -> Tid {
        self.0.tid
    }

    pub fn status(&self) -> ThreadStatus {
        self.0.status.get()
    }

    pub fn is_idle(&self) -> bool {
        self.0.tid == IDLE_TID
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.0.status.set(status);
    }

    pub(crate) fn context(&self) -> *mut Context {
        self.0.context.get()
    }

    pub(crate) fn take_entry(&self) -> Option<ThreadFunction> {
        self.0.entry.take()
    }

    /// Whether the thread still owns a stack. False for the idle thread and
    /// for exited threads that have been reaped.
    pub fn has_stack(&self) -> bool {
        let stack = self.0.stack.take();
        let present = stack.is_some();
        self.0.stack.set(stack);
        present
    }

    /// Frees the thread's stack. Only valid once the thread can never be
    /// switched to again.
    pub(crate) fn release_stack(&self) {
        drop(self.0.stack.take());
    }

    pub fn as_ptr(&self) -> *const ThreadControlBlock {
        Rc::as_ptr(&self.0)
    }

    /// Rebuilds a handle from a pointer obtained through [`ThreadRef::as_ptr`].
    ///
    /// # Safety
    /// `ptr` must come from `as_ptr` on a handle to a thread that is still
    /// referenced by some other handle.
    pub unsafe fn from_ptr(ptr: *const ThreadControlBlock) -> Self {
        Rc::increment_strong_count(ptr);
        Self(Rc::from_raw(ptr))
    }
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ThreadRef {}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRef")
            .field("tid", &self.tid())
            .field("status", &self.status())
            .finish()
    }
}
