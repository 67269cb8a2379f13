use super::scheduler::Scheduler;
use crate::threading::thread_control_block::{ThreadRef, ThreadStatus};
use log::warn;
use uthread_queue::{Queue, QueueError};

pub struct FifoScheduler {
    ready_queue: Queue<ThreadRef>,
}

impl Scheduler for FifoScheduler {
    fn new() -> FifoScheduler {
        FifoScheduler {
            ready_queue: Queue::new(),
        }
    }

    fn push(&mut self, thread: ThreadRef) -> Result<(), QueueError> {
        self.ready_queue.enqueue(thread)
    }

    fn pop(&mut self) -> Option<ThreadRef> {
        // Entries that are not ready are rotated to the back, at most once
        // each. Re-enqueueing reuses the slot the dequeue just freed.
        for _ in 0..self.ready_queue.len() {
            let thread = self.ready_queue.dequeue().ok()?;
            if thread.status() == ThreadStatus::Ready {
                return Some(thread);
            }

            warn!(
                "skipping thread {} in state {:?} on the ready queue",
                thread.tid(),
                thread.status()
            );
            self.ready_queue.enqueue(thread).ok()?;
        }

        None
    }

    fn len(&self) -> usize {
        self.ready_queue.len()
    }

    fn has_ready(&self) -> bool {
        self.ready_queue
            .iter()
            .any(|thread| thread.status() == ThreadStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::thread_control_block::ThreadControlBlock;

    fn thread(tid: u64) -> ThreadRef {
        ThreadRef::new(ThreadControlBlock::create(tid, Box::new(|| {}), 32 * 1024).unwrap())
    }

    #[test]
    fn test_pop_is_fifo() {
        let mut scheduler = FifoScheduler::new();
        let threads: Vec<_> = (1..=3).map(thread).collect();
        for t in &threads {
            scheduler.push(t.clone()).unwrap();
        }

        assert_eq!(scheduler.len(), 3);
        for t in &threads {
            assert_eq!(scheduler.pop().as_ref(), Some(t));
        }
        assert!(scheduler.pop().is_none());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_pop_skips_threads_that_are_not_ready() {
        let mut scheduler = FifoScheduler::new();
        let blocked = thread(1);
        let ready = thread(2);
        blocked.set_status(ThreadStatus::Blocked);
        scheduler.push(blocked.clone()).unwrap();
        scheduler.push(ready.clone()).unwrap();

        assert!(scheduler.has_ready());
        assert_eq!(scheduler.pop(), Some(ready));

        // The skipped thread stays queued, and a full pass finds nothing.
        assert_eq!(scheduler.len(), 1);
        assert!(!scheduler.has_ready());
        assert!(scheduler.pop().is_none());
        assert_eq!(scheduler.len(), 1);

        blocked.set_status(ThreadStatus::Ready);
        assert_eq!(scheduler.pop(), Some(blocked));
    }
}
