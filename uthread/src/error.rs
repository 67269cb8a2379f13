use thiserror::Error;
use uthread_queue::QueueError;

/// Error type for runtime operations
#[derive(Debug, Error)]
pub enum Error {
    /// The operation needs a runtime, but none is active on this carrier
    #[error("no thread runtime is active on this carrier")]
    NotRunning,
    /// `run` was called from inside a running runtime
    #[error("a thread runtime is already active on this carrier")]
    AlreadyRunning,
    /// The memory for a new thread's stack could not be allocated
    #[error("could not allocate a {size}-byte thread stack")]
    StackAlloc { size: usize },
    /// The configured stack cannot hold a thread
    #[error("a {size}-byte thread stack is below the {min}-byte minimum")]
    StackTooSmall { size: usize, min: usize },
    /// The platform refused to initialize an execution context
    #[error("could not initialize a thread context")]
    Context(#[source] std::io::Error),
    /// The preemption signal handler or timer could not be set up
    #[error("could not set up the preemption timer")]
    Timer(#[source] nix::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
