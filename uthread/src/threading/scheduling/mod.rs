mod fifo_scheduler;
mod scheduler;

pub use fifo_scheduler::FifoScheduler;
pub use scheduler::Scheduler;

use super::{
    context_switch::{switch_threads, Context},
    system_mut,
    thread_control_block::{ThreadRef, ThreadStatus},
    ThreadSystem,
};
use crate::{
    error::{Error, Result},
    preemption::{self, hold_preemption},
};
use core::mem;
use log::{trace, warn};

impl ThreadSystem {
    /// Makes the next ready thread the running one.
    ///
    /// Returns the contexts to switch between, or `None` when the current
    /// thread simply keeps running. The previous thread goes back on the
    /// ready queue only if it is still `Running`; that push reuses the slot
    /// the pop just freed, so this never allocates.
    pub(super) fn schedule_next(&mut self) -> Option<(*mut Context, *mut Context)> {
        let previous_status = self.running.status();

        let Some(next) = self.scheduler.pop() else {
            if previous_status == ThreadStatus::Running {
                return None;
            }
            panic!(
                "no threads to run after thread {} became {:?}",
                self.running.tid(),
                previous_status
            );
        };

        next.set_status(ThreadStatus::Running);
        if next == self.running {
            return None;
        }

        let previous = mem::replace(&mut self.running, next);
        if previous_status == ThreadStatus::Running {
            previous.set_status(ThreadStatus::Ready);
            if self.scheduler.push(previous.clone()).is_err() {
                panic!("cannot requeue thread {}", previous.tid());
            }
        }

        // Blocked threads are kept alive by `blocked`, exited ones by `dying`.
        Some((previous.context(), self.running.context()))
    }
}

fn scheduler_yield() {
    preemption::disable();

    // SAFETY: Preemption is disabled until the switch completes.
    match unsafe { system_mut() }.and_then(ThreadSystem::schedule_next) {
        // SAFETY: Both contexts belong to live threads and the running slot
        // has been updated.
        Some((from, to)) => unsafe { switch_threads(from, to) },
        None => preemption::enable(),
    }
}

/// Voluntarily relinquishes the carrier to the next ready thread.
///
/// Outside a running thread system this does nothing. Preemption is enabled
/// when it returns.
pub fn yield_now() {
    scheduler_yield();
}

/// Suspends the current thread until another thread calls [`unblock`] on it.
pub fn block() -> Result<()> {
    let _guard = hold_preemption();

    // SAFETY: Preemption is disabled.
    let system = unsafe { system_mut() }.ok_or(Error::NotRunning)?;
    if system.running.is_idle() {
        panic!("the idle thread cannot block");
    }

    system.blocked.enqueue(system.running.clone())?;
    system.running.set_status(ThreadStatus::Blocked);
    trace!("thread {} blocked", system.running.tid());

    scheduler_yield();
    Ok(())
}

/// Makes a blocked thread ready again and appends it to the ready queue.
///
/// A thread that was not blocked is appended all the same; the scheduler
/// skips it until it is ready.
pub fn unblock(thread: &ThreadRef) -> Result<()> {
    let _guard = hold_preemption();

    // SAFETY: Preemption is disabled.
    let system = unsafe { system_mut() }.ok_or(Error::NotRunning)?;
    // Queued first so that a failed push leaves the thread untouched. The
    // scheduler cannot pop it before the status below is set.
    system.scheduler.push(thread.clone())?;
    match thread.status() {
        ThreadStatus::Blocked => {
            // Absent when the thread belongs to another carrier's system.
            let _ = system.blocked.delete(thread);
            thread.set_status(ThreadStatus::Ready);
        }
        status => warn!("unblocking thread {} which is {status:?}", thread.tid()),
    }

    trace!("thread {} unblocked", thread.tid());
    Ok(())
}

/// Switches away from an exiting thread for good.
///
/// Preemption must already be disabled.
pub(crate) fn scheduler_yield_and_die() -> ! {
    // SAFETY: Preemption is disabled.
    let Some(system) = (unsafe { system_mut() }) else {
        panic!("no thread system to exit from");
    };

    system.running.set_status(ThreadStatus::Exited);
    if system.dying.enqueue(system.running.clone()).is_err() {
        panic!("cannot park exiting thread {}", system.running.tid());
    }

    if let Some((from, to)) = system.schedule_next() {
        // SAFETY: The dying queue keeps this thread's context and stack alive
        // until the idle thread reaps it, which is after this switch.
        unsafe { Context::switch(from, to) };
    }

    unreachable!("an exited thread was resumed");
}
