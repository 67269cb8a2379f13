//! Timer-driven preemption.
//!
//! While a runtime runs with preemption on, a per-carrier timer on the
//! carrier's CPU-time clock raises `SIGVTALRM` at a fixed rate, and the
//! handler forces a yield. Scheduler state must never be touched while the
//! tick can fire: [`disable`]/[`enable`] and [`hold_preemption`] mask it on
//! the calling carrier.

use crate::{
    config::{Config, MAX_PREEMPT_HZ},
    error::{Error, Result},
    threading::scheduling,
};
use core::{marker::PhantomData, time::Duration};
use log::{debug, warn};
use nix::{
    sys::{
        signal::{self, SaFlags, SigAction, SigEvent, SigHandler, SigSet, SigevNotify, SigmaskHow, Signal},
        time::TimeSpec,
        timer::{Expiration, Timer, TimerSetTimeFlags},
    },
    time::ClockId,
    unistd::gettid,
};
use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::{Mutex, PoisonError},
};

const TICK: Signal = Signal::SIGVTALRM;

fn tick_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(TICK);
    set
}

/// Masks the preemption tick on this carrier.
///
/// Calls do not nest: a single [`enable`] undoes any number of `disable`s.
pub fn disable() {
    // pthread_sigmask can only fail on an invalid `how`.
    let _ = tick_set().thread_block();
}

/// Unmasks the preemption tick on this carrier. A tick that arrived while
/// masked is delivered now.
pub fn enable() {
    let _ = tick_set().thread_unblock();
}

/// Whether the preemption tick is currently deliverable on this carrier.
pub fn is_enabled() -> bool {
    SigSet::thread_get_mask().map_or(false, |mask| !mask.contains(TICK))
}

/// Masks the tick until the returned guard is dropped.
///
/// Unlike a bare [`disable`]/[`enable`] pair, the guard restores whatever
/// state it found, so guarded regions may be nested.
pub fn hold_preemption() -> PreemptionGuard {
    let previous = tick_set().thread_swap_mask(SigmaskHow::SIG_BLOCK);

    PreemptionGuard {
        preemption_was_enabled: previous.map_or(false, |mask| !mask.contains(TICK)),
        _carrier: PhantomData,
    }
}

/// A guard type that ensures preemption is disabled as long as it is held.
pub struct PreemptionGuard {
    /// Preemption enabled when this guard was created
    preemption_was_enabled: bool,
    // The signal mask belongs to one carrier.
    _carrier: PhantomData<*const ()>,
}

impl PreemptionGuard {
    pub fn preemption_was_enabled(&self) -> bool {
        self.preemption_was_enabled
    }
}

impl Drop for PreemptionGuard {
    fn drop(&mut self) {
        if self.preemption_was_enabled {
            enable();
        }
    }
}

struct TickHandler {
    carriers: usize,
    previous: Option<SigAction>,
}

// The signal disposition is process-wide, while timers are per carrier.
static TICK_HANDLER: Mutex<TickHandler> = Mutex::new(TickHandler {
    carriers: 0,
    previous: None,
});

extern "C" fn on_tick(_signal: libc::c_int) {
    scheduling::yield_now();
}

fn install_handler() -> nix::Result<()> {
    let mut handler = TICK_HANDLER.lock().unwrap_or_else(PoisonError::into_inner);
    if handler.carriers == 0 {
        let action = SigAction::new(
            SigHandler::Handler(on_tick),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: `on_tick` only reaches the scheduler of the carrier it
        // interrupts, and every scheduler mutation runs with the tick masked.
        handler.previous = Some(unsafe { signal::sigaction(TICK, &action) }?);
    }
    handler.carriers += 1;
    Ok(())
}

fn remove_handler() {
    let mut handler = TICK_HANDLER.lock().unwrap_or_else(PoisonError::into_inner);
    handler.carriers = handler.carriers.saturating_sub(1);
    if handler.carriers > 0 {
        return;
    }

    if let Some(previous) = handler.previous.take() {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // SAFETY: Ignoring first discards a tick still pending on a carrier,
        // which would otherwise hit the restored (usually fatal) default.
        unsafe {
            let _ = signal::sigaction(TICK, &ignore);
            let _ = signal::sigaction(TICK, &previous);
        }
    }
}

fn arm_timer(period: Duration) -> nix::Result<Timer> {
    let event = SigEvent::new(SigevNotify::SigevThreadId {
        signal: TICK,
        thread_id: gettid().as_raw(),
        si_value: 0,
    });
    let mut timer = Timer::new(ClockId::CLOCK_THREAD_CPUTIME_ID, event)?;
    timer.set(
        Expiration::Interval(TimeSpec::from_duration(period)),
        TimerSetTimeFlags::empty(),
    )?;
    Ok(timer)
}

/// An armed (or deliberately absent) preemption timer for this carrier.
///
/// Dropping it disarms the timer; the last carrier in the process to disarm
/// also puts back the signal disposition that was in place before.
pub struct Preemption {
    timer: Option<Timer>,
}

impl Preemption {
    pub fn start(enabled: bool, config: &Config) -> Result<Preemption> {
        if !enabled {
            return Ok(Preemption { timer: None });
        }

        if !(1..=MAX_PREEMPT_HZ).contains(&config.preempt_hz) {
            warn!(
                "preemption rate {} Hz out of range, ticking every {:?}",
                config.preempt_hz,
                config.tick_period()
            );
        }

        install_handler().map_err(Error::Timer)?;
        let timer = arm_timer(config.tick_period()).map_err(|err| {
            remove_handler();
            Error::Timer(err)
        })?;

        debug!("preemption armed at {} Hz", config.preempt_hz);
        Ok(Preemption { timer: Some(timer) })
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Disarms the timer now instead of when `self` goes out of scope.
    pub fn stop(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            drop(timer);
            remove_handler();
            debug!("preemption disarmed");
        }
    }
}

impl Drop for Preemption {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// A global allocator that keeps the tick masked while it runs.
///
/// Without it, a tick landing inside `malloc` can switch to another thread
/// on the same carrier that then allocates too, and the allocator's lock is
/// not reentrant.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: uthread::preemption::PreemptSafeAlloc = uthread::preemption::PreemptSafeAlloc;
/// ```
pub struct PreemptSafeAlloc;

unsafe impl GlobalAlloc for PreemptSafeAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _guard = hold_preemption();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let _guard = hold_preemption();
        System.alloc_zeroed(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _guard = hold_preemption();
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let _guard = hold_preemption();
        System.realloc(ptr, layout, new_size)
    }
}
