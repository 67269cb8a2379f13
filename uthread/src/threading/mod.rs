mod context_switch;
pub mod scheduling;
pub mod thread_control_block;
pub mod thread_functions;

use crate::{
    config::Config,
    error::{Error, Result},
    preemption::{hold_preemption, Preemption},
};
use core::{cell::Cell, ptr};
use log::{debug, info, warn};
use scheduling::{yield_now, FifoScheduler, Scheduler};
use thread_control_block::{ThreadControlBlock, ThreadRef, Tid, IDLE_TID};
use uthread_queue::Queue;

thread_local! {
    // Read from the tick handler, so it must never need lazy initialization
    // or a destructor.
    static THREAD_SYSTEM: Cell<*mut ThreadSystem> = const { Cell::new(ptr::null_mut()) };
}

/// Everything one carrier needs to run green threads.
pub(crate) struct ThreadSystem {
    scheduler: Box<dyn Scheduler>,
    running: ThreadRef,
    // Holds a handle to every blocked thread so it stays alive while
    // suspended, whether or not anyone else does.
    blocked: Queue<ThreadRef>,
    // Exited threads whose stacks have not been released yet.
    dying: Queue<ThreadRef>,
    next_tid: Tid,
    config: Config,
}

impl ThreadSystem {
    fn new(config: Config) -> ThreadSystem {
        ThreadSystem {
            scheduler: Box::new(FifoScheduler::new()),
            running: ThreadRef::new(ThreadControlBlock::create_idle_thread()),
            blocked: Queue::new(),
            dying: Queue::new(),
            next_tid: IDLE_TID + 1,
            config,
        }
    }

    /// Releases the stacks of exited threads. Must run on the idle thread.
    fn reap(&mut self) {
        while let Ok(thread) = self.dying.dequeue() {
            thread.release_stack();
            debug!("reaped thread {}", thread.tid());
        }
    }
}

/// Gets the thread system of this carrier.
///
/// # Safety
/// Preemption must be disabled while the returned reference is used to read
/// or modify scheduler state, and it must not outlive the current `run`.
pub(crate) unsafe fn system_mut<'a>() -> Option<&'a mut ThreadSystem> {
    THREAD_SYSTEM.get().as_mut()
}

/// Publishes a thread system on this carrier for as long as it lives.
struct Installed {
    system: *mut ThreadSystem,
}

impl Installed {
    fn new(system: ThreadSystem) -> Installed {
        let system = Box::into_raw(Box::new(system));
        THREAD_SYSTEM.set(system);
        Installed { system }
    }

    /// # Safety
    /// Must only be called on the idle thread with preemption disabled.
    unsafe fn system(&mut self) -> &mut ThreadSystem {
        &mut *self.system
    }
}

impl Drop for Installed {
    fn drop(&mut self) {
        let _guard = hold_preemption();
        THREAD_SYSTEM.set(ptr::null_mut());

        // SAFETY: The pointer came from `Box::into_raw` and is no longer
        // published.
        drop(unsafe { Box::from_raw(self.system) });
    }
}

/// Creates a new thread that runs `entry` and appends it to the ready queue.
pub fn create<F>(entry: F) -> Result<ThreadRef>
where
    F: FnOnce() + 'static,
{
    let _guard = hold_preemption();

    // SAFETY: Preemption is disabled.
    let system = unsafe { system_mut() }.ok_or(Error::NotRunning)?;
    let tid = system.next_tid;
    let thread = ThreadRef::new(ThreadControlBlock::create(
        tid,
        Box::new(entry),
        system.config.stack_size,
    )?);

    system.scheduler.push(thread.clone())?;
    system.next_tid += 1;

    debug!("created thread {tid}");
    Ok(thread)
}

/// The thread currently running on this carrier.
pub fn current() -> Option<ThreadRef> {
    let _guard = hold_preemption();

    // SAFETY: Preemption is disabled.
    unsafe { system_mut() }.map(|system| system.running.clone())
}

/// Runs `entry` as the first green thread on this carrier, with the
/// process-wide configuration, and returns once no thread is ready to run.
pub fn run<F>(preempt: bool, entry: F) -> Result<()>
where
    F: FnOnce() + 'static,
{
    run_with(Config::global(), preempt, entry)
}

/// Like [`run`], with an explicit configuration.
pub fn run_with<F>(config: Config, preempt: bool, entry: F) -> Result<()>
where
    F: FnOnce() + 'static,
{
    // SAFETY: Only checks whether a system is installed.
    if unsafe { system_mut() }.is_some() {
        return Err(Error::AlreadyRunning);
    }

    // The caller becomes the idle thread.
    let mut installed = Installed::new(ThreadSystem::new(config));
    let preemption = Preemption::start(preempt, &config)?;
    info!(
        "thread system started (preemption {})",
        if preemption.is_armed() { "on" } else { "off" }
    );

    create(entry)?;

    loop {
        yield_now();

        let _guard = hold_preemption();
        // SAFETY: We are the idle thread and preemption is disabled.
        let system = unsafe { installed.system() };
        system.reap();
        if !system.scheduler.has_ready() {
            break;
        }
    }

    preemption.stop();

    let blocked = {
        let _guard = hold_preemption();
        // SAFETY: As above.
        unsafe { installed.system() }.blocked.len()
    };
    if blocked > 0 {
        warn!("{blocked} threads still blocked with nothing left to run");
    }

    drop(installed);
    info!("thread system stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        scheduling::{block, unblock},
        thread_control_block::ThreadStatus,
        thread_functions::exit_thread,
        *,
    };
    use crate::preemption;
    use core::{
        cell::RefCell,
        hint,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };
    use std::{rc::Rc, time::Instant};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn fast_ticks() -> Config {
        Config {
            preempt_hz: 1000,
            ..Config::default()
        }
    }

    #[test]
    fn test_round_robin_order() {
        init();
        let trace = Rc::new(RefCell::new(Vec::new()));

        let t = trace.clone();
        run(false, move || {
            for id in 1..=3 {
                let t = t.clone();
                create(move || {
                    for _ in 0..3 {
                        t.borrow_mut().push(id);
                        yield_now();
                    }
                })
                .unwrap();
            }
        })
        .unwrap();

        assert_eq!(*trace.borrow(), [1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_exited_thread_is_reclaimed() {
        init();
        let handle = Rc::new(RefCell::new(None));

        let h = handle.clone();
        run_with(Config::default(), false, move || {
            let thread = create(|| {
                yield_now();
                exit_thread();
            })
            .unwrap();
            *h.borrow_mut() = Some(thread);
        })
        .unwrap();

        let thread = handle.borrow_mut().take().unwrap();
        assert_eq!(thread.status(), ThreadStatus::Exited);
        assert!(!thread.has_stack());
    }

    #[test]
    fn test_thread_ids_and_current() {
        init();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        run_with(Config::default(), false, move || {
            let me = current().unwrap();
            s.borrow_mut().push((me.tid(), me.status()));

            let s = s.clone();
            create(move || {
                let me = current().unwrap();
                s.borrow_mut().push((me.tid(), me.status()));
            })
            .unwrap();
        })
        .unwrap();

        assert_eq!(
            *seen.borrow(),
            [(1, ThreadStatus::Running), (2, ThreadStatus::Running)]
        );
        assert!(current().is_none());
    }

    #[test]
    fn test_nested_run_is_rejected() {
        init();
        let nested = Rc::new(RefCell::new(None));

        let n = nested.clone();
        run_with(Config::default(), false, move || {
            *n.borrow_mut() = Some(run(false, || {}));
        })
        .unwrap();

        assert!(matches!(
            nested.borrow_mut().take(),
            Some(Err(Error::AlreadyRunning))
        ));
    }

    #[test]
    fn test_run_rejects_undersized_stack() {
        init();
        let ran = Rc::new(Cell::new(false));

        let r = ran.clone();
        let config = Config {
            stack_size: 0,
            ..Config::default()
        };
        let result = run_with(config, false, move || r.set(true));

        assert!(matches!(result, Err(Error::StackTooSmall { size: 0, .. })));
        assert!(!ran.get());
        assert!(current().is_none());
    }

    #[test]
    fn test_run_fails_when_first_stack_cannot_be_allocated() {
        init();
        let config = Config {
            stack_size: usize::MAX,
            ..Config::default()
        };

        assert!(matches!(
            run_with(config, true, || {}),
            Err(Error::StackAlloc { size: usize::MAX })
        ));
        assert!(current().is_none());
        assert!(preemption::is_enabled());
    }

    #[test]
    fn test_failed_create_registers_nothing() {
        init();
        let observed = Rc::new(RefCell::new(None));

        let o = observed.clone();
        run_with(Config::default(), false, move || {
            let before = {
                let _guard = hold_preemption();
                let system = unsafe { system_mut() }.unwrap();
                (system.scheduler.len(), system.next_tid)
            };

            // Only creation reads the stack size, so shrinking it here makes
            // the next `create` fail.
            {
                let _guard = hold_preemption();
                unsafe { system_mut() }.unwrap().config.stack_size = 0;
            }
            let result = create(|| {});

            let after = {
                let _guard = hold_preemption();
                let system = unsafe { system_mut() }.unwrap();
                system.config.stack_size = Config::default().stack_size;
                (system.scheduler.len(), system.next_tid)
            };
            let next = create(|| {}).unwrap().tid();

            *o.borrow_mut() = Some((result.is_err(), before, after, next));
        })
        .unwrap();

        let (failed, before, after, next) = observed.borrow_mut().take().unwrap();
        assert!(failed);
        assert_eq!(before, after);
        assert_eq!(next, before.1);
    }

    #[test]
    fn test_calls_outside_a_runtime() {
        assert!(matches!(create(|| {}), Err(Error::NotRunning)));
        assert!(matches!(block(), Err(Error::NotRunning)));
        assert!(current().is_none());
        // Nothing to switch to; returns with preemption on.
        yield_now();
        assert!(preemption::is_enabled());
    }

    #[test]
    #[should_panic(expected = "outside of a running thread system")]
    fn test_exit_outside_a_runtime_panics() {
        exit_thread();
    }

    #[test]
    fn test_panicking_thread_does_not_stop_others() {
        init();
        let finished = Rc::new(Cell::new(false));

        let f = finished.clone();
        run_with(Config::default(), false, move || {
            create(|| panic!("thread gave up")).unwrap();
            create(move || f.set(true)).unwrap();
        })
        .unwrap();

        assert!(finished.get());
    }

    #[test]
    fn test_block_and_unblock() {
        init();
        let log = Rc::new(RefCell::new(Vec::new()));
        let status_while_blocked = Rc::new(Cell::new(None));

        let (l, s) = (log.clone(), status_while_blocked.clone());
        run_with(Config::default(), false, move || {
            let sleeper = {
                let l = l.clone();
                create(move || {
                    l.borrow_mut().push("sleep");
                    block().unwrap();
                    l.borrow_mut().push("woke");
                })
                .unwrap()
            };

            yield_now();
            s.set(Some(sleeper.status()));
            l.borrow_mut().push("wake");
            unblock(&sleeper).unwrap();
        })
        .unwrap();

        assert_eq!(status_while_blocked.get(), Some(ThreadStatus::Blocked));
        assert_eq!(*log.borrow(), ["sleep", "wake", "woke"]);
    }

    #[test]
    fn test_run_returns_with_threads_left_blocked() {
        init();
        let handle = Rc::new(RefCell::new(None));

        let h = handle.clone();
        run_with(Config::default(), false, move || {
            *h.borrow_mut() = Some(current().unwrap());
            block().unwrap();
        })
        .unwrap();

        let thread = handle.borrow_mut().take().unwrap();
        assert_eq!(thread.status(), ThreadStatus::Blocked);
    }

    #[test]
    fn test_unblocking_a_ready_thread_runs_it_once() {
        init();
        let runs = Rc::new(Cell::new(0));

        let r = runs.clone();
        run_with(Config::default(), false, move || {
            let thread = create(move || r.set(r.get() + 1)).unwrap();
            unblock(&thread).unwrap();
        })
        .unwrap();

        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn test_preemption_interrupts_spinning_thread() {
        init();
        let flag = Rc::new(AtomicBool::new(false));

        let f = flag.clone();
        run_with(fast_ticks(), true, move || {
            let other = f.clone();
            create(move || other.store(true, Ordering::Relaxed)).unwrap();

            // Never yields voluntarily.
            while !f.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        })
        .unwrap();

        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_spinning_threads_take_turns() {
        init();
        let a = Rc::new(AtomicBool::new(false));
        let b = Rc::new(AtomicBool::new(false));

        let (a1, b1) = (a.clone(), b.clone());
        let (a2, b2) = (a.clone(), b.clone());
        run_with(fast_ticks(), true, move || {
            create(move || {
                a1.store(true, Ordering::Relaxed);
                while !b1.load(Ordering::Relaxed) {
                    hint::spin_loop();
                }
            })
            .unwrap();
            create(move || {
                b2.store(true, Ordering::Relaxed);
                while !a2.load(Ordering::Relaxed) {
                    hint::spin_loop();
                }
            })
            .unwrap();
        })
        .unwrap();

        assert!(a.load(Ordering::Relaxed) && b.load(Ordering::Relaxed));
    }

    #[test]
    fn test_out_of_range_rate_still_preempts() {
        init();
        let flag = Rc::new(AtomicBool::new(false));

        let f = flag.clone();
        let config = Config {
            preempt_hz: 2_000_000_000,
            ..Config::default()
        };
        run_with(config, true, move || {
            let other = f.clone();
            create(move || other.store(true, Ordering::Relaxed)).unwrap();

            while !f.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        })
        .unwrap();

        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_disabled_preemption_keeps_thread_on_carrier() {
        init();
        let flag = Rc::new(AtomicBool::new(false));
        let ran_while_masked = Rc::new(Cell::new(None));

        let (f, r) = (flag.clone(), ran_while_masked.clone());
        run_with(fast_ticks(), true, move || {
            let other = f.clone();
            create(move || other.store(true, Ordering::Relaxed)).unwrap();

            preemption::disable();
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(20) {
                hint::spin_loop();
            }
            r.set(Some(f.load(Ordering::Relaxed)));
            preemption::enable();

            while !f.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        })
        .unwrap();

        assert_eq!(ran_while_masked.get(), Some(false));
        assert!(flag.load(Ordering::Relaxed));
    }
}
