use crate::threading::thread_control_block::ThreadRef;
use uthread_queue::QueueError;

pub trait Scheduler {
    fn new() -> Self
    where
        Self: Sized;

    /// Appends a thread at the back of the ready queue.
    fn push(&mut self, thread: ThreadRef) -> Result<(), QueueError>;

    /// Takes the next thread that is ready to run, if any.
    fn pop(&mut self) -> Option<ThreadRef>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether some queued thread is ready to run.
    fn has_ready(&self) -> bool;
}
