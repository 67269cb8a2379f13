//! Green threads on a single carrier.
//!
//! [`run`] turns the calling OS thread into a carrier and runs green threads
//! on it in round-robin order until none is ready. Threads switch when they
//! [`yield_now`], [`block`] or [`exit`], and, with preemption on, whenever the
//! carrier's `SIGVTALRM` tick fires.
//!
//! ```no_run
//! use std::rc::Rc;
//! use uthread::{create, run, yield_now, Semaphore};
//!
//! run(true, || {
//!     let ready = Rc::new(Semaphore::new(0));
//!     let signal = ready.clone();
//!     create(move || {
//!         yield_now();
//!         signal.up().unwrap();
//!     })
//!     .unwrap();
//!     ready.down().unwrap();
//! })
//! .unwrap();
//! ```
//!
//! Code that allocates while preemptible should install
//! [`preemption::PreemptSafeAlloc`] as the global allocator.

pub mod config;
pub mod error;
pub mod preemption;
pub mod sync;
pub mod threading;

pub use config::Config;
pub use error::{Error, Result};
pub use sync::Semaphore;
pub use threading::{
    create, current, run, run_with,
    scheduling::{block, unblock, yield_now},
    thread_control_block::{ThreadRef, ThreadStatus, Tid},
    thread_functions::exit_thread as exit,
};
pub use uthread_queue::{Position, Queue, QueueError};

#[cfg(test)]
#[global_allocator]
static ALLOCATOR: preemption::PreemptSafeAlloc = preemption::PreemptSafeAlloc;
