use crate::{
    error::{Error, Result},
    preemption::hold_preemption,
    threading::{
        current,
        scheduling::{block, unblock},
        thread_control_block::ThreadRef,
    },
};
use core::cell::{Cell, RefCell};
use log::{trace, warn};
use uthread_queue::Queue;

/// A counting semaphore for green threads on one carrier.
///
/// Share it between threads with `Rc`. Waiters are served in the order they
/// arrived, and `up` hands the resource straight to the oldest one.
pub struct Semaphore {
    count: Cell<usize>,
    waiters: RefCell<Queue<ThreadRef>>,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            count: Cell::new(count),
            waiters: RefCell::new(Queue::new()),
        }
    }

    /// Frees the semaphore, or gives it back if threads are still waiting on
    /// it.
    pub fn destroy(self) -> Result<(), Self> {
        if self.waiters() > 0 {
            return Err(self);
        }
        Ok(())
    }

    /// Takes one unit of the resource, blocking the current thread until one
    /// is available.
    pub fn down(&self) -> Result<()> {
        let _guard = hold_preemption();

        let count = self.count.get();
        if count > 0 {
            self.count.set(count - 1);
            return Ok(());
        }

        let thread = current().ok_or(Error::NotRunning)?;
        self.waiters.borrow_mut().enqueue(thread.clone())?;
        trace!("thread {} waiting on semaphore", thread.tid());

        if let Err(err) = block() {
            let _ = self.waiters.borrow_mut().delete(&thread);
            return Err(err);
        }

        // Resumed by `up`, which handed the unit over without counting it.
        Ok(())
    }

    /// Takes one unit if one is available, without blocking.
    pub fn try_down(&self) -> bool {
        let _guard = hold_preemption();

        let count = self.count.get();
        if count == 0 {
            return false;
        }
        self.count.set(count - 1);
        true
    }

    /// Releases one unit, waking the oldest waiter if there is one.
    pub fn up(&self) -> Result<()> {
        let _guard = hold_preemption();

        let waiter = self.waiters.borrow().front().cloned();
        match waiter {
            Some(thread) => {
                // The waiter keeps its place until it has really been woken.
                unblock(&thread)?;
                let _ = self.waiters.borrow_mut().dequeue();
                trace!("handed semaphore to thread {}", thread.tid());
                Ok(())
            }
            None => {
                self.count.set(self.count.get() + 1);
                Ok(())
            }
        }
    }

    pub fn count(&self) -> usize {
        self.count.get()
    }

    pub fn waiters(&self) -> usize {
        self.waiters.borrow().len()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let waiters = self.waiters.get_mut().len();
        if waiters > 0 {
            warn!("semaphore dropped with {waiters} threads waiting on it");
        }
    }
}
