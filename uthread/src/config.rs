//! Runtime settings, with overrides read from the environment.
//!
//! `UTHREAD_PREEMPT_HZ` accepts a frequency (`100`, `250hz`) or a tick period
//! (`10ms`, `2500us`). `UTHREAD_STACK_SIZE` accepts a byte count with an
//! optional `k` or `m` suffix (`65536`, `64k`, `1m`).

use core::time::Duration;
use log::warn;
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{digit1, one_of, space0},
    combinator::{all_consuming, eof, map, map_res, opt},
    sequence::{preceded, tuple},
    IResult,
};
use once_cell::sync::Lazy;
use std::env;

pub const DEFAULT_PREEMPT_HZ: u32 = 100;
// One tick per microsecond of carrier CPU time. Faster rates would round the
// timer interval down to zero, which disarms it.
pub const MAX_PREEMPT_HZ: u32 = 1_000_000;
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
// Anything smaller does not leave room for a signal frame plus the
// trampoline's own locals.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

pub const PREEMPT_HZ_VAR: &str = "UTHREAD_PREEMPT_HZ";
pub const STACK_SIZE_VAR: &str = "UTHREAD_STACK_SIZE";

static GLOBAL: Lazy<Config> = Lazy::new(Config::from_env);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Timer ticks per second of carrier CPU time while preemption is on.
    pub preempt_hz: u32,
    /// Size in bytes of each thread's stack.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preempt_hz: DEFAULT_PREEMPT_HZ,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl Config {
    /// The process-wide configuration, read from the environment once.
    pub fn global() -> Config {
        *GLOBAL
    }

    pub fn from_env() -> Config {
        let mut config = Config::default();

        if let Ok(value) = env::var(PREEMPT_HZ_VAR) {
            match parse_frequency(&value) {
                Some(hz) => config.preempt_hz = hz,
                None => warn!("ignoring {PREEMPT_HZ_VAR}={value:?}, using {} Hz", config.preempt_hz),
            }
        }

        if let Ok(value) = env::var(STACK_SIZE_VAR) {
            match parse_stack_size(&value) {
                Some(size) => config.stack_size = size,
                None => warn!("ignoring {STACK_SIZE_VAR}={value:?}, using {} bytes", config.stack_size),
            }
        }

        config
    }

    /// The time between two preemption ticks. Rates outside
    /// `1..=MAX_PREEMPT_HZ` are clamped into it.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.preempt_hz.clamp(1, MAX_PREEMPT_HZ)
    }
}

enum Rate {
    Hertz(u64),
    Period(Duration),
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(input)
}

fn rate(input: &str) -> IResult<&str, Rate> {
    let (input, count) = number(input)?;
    preceded(
        space0,
        alt((
            map(tag_no_case("hz"), move |_| Rate::Hertz(count)),
            map(tag_no_case("ms"), move |_| {
                Rate::Period(Duration::from_millis(count))
            }),
            map(tag_no_case("us"), move |_| {
                Rate::Period(Duration::from_micros(count))
            }),
            map(eof, move |_| Rate::Hertz(count)),
        )),
    )(input)
}

fn byte_count(input: &str) -> IResult<&str, (u64, Option<char>)> {
    tuple((number, preceded(space0, opt(one_of("kKmM")))))(input)
}

/// Parses a preemption frequency. Periods longer than one second, zero rates
/// and rates above [`MAX_PREEMPT_HZ`] are rejected.
pub fn parse_frequency(input: &str) -> Option<u32> {
    let (_, rate) = all_consuming(rate)(input.trim()).ok()?;
    let hz = match rate {
        Rate::Hertz(hz) => hz,
        Rate::Period(period) => {
            let micros = u64::try_from(period.as_micros()).ok()?;
            if micros == 0 {
                return None;
            }
            1_000_000 / micros
        }
    };
    u32::try_from(hz)
        .ok()
        .filter(|&hz| (1..=MAX_PREEMPT_HZ).contains(&hz))
}

/// Parses a stack size, rejecting anything below [`MIN_STACK_SIZE`].
pub fn parse_stack_size(input: &str) -> Option<usize> {
    let (_, (count, unit)) = all_consuming(byte_count)(input.trim()).ok()?;
    let scale: u64 = match unit {
        Some('k' | 'K') => 1 << 10,
        Some('m' | 'M') => 1 << 20,
        _ => 1,
    };
    let bytes = count.checked_mul(scale)?;
    usize::try_from(bytes)
        .ok()
        .filter(|&bytes| bytes >= MIN_STACK_SIZE)
}
