// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Monotonic virtual time.
//!
//! All packet timestamps share one clock rate ([`CLOCK_RATE`], 180 kHz: a
//! common multiple of the usual audio and video rates). A [`Clock`] yields
//! the current time as an exact [`Fraction`] of seconds; implementations may
//! run at any speed, including `0.0` for externally-driven test clocks.

use crate::fraction::{div_up, Fraction};
use std::sync::Mutex;
use std::time::Instant;

/// Ticks per second of the common media clock.
pub const CLOCK_RATE: i64 = 180_000;

/// A monotonic time source.
pub trait Clock: Send + Sync {
    /// Current time, in seconds.
    fn now(&self) -> Fraction;

    /// Speed relative to wall time. `0.0` means the clock only moves when
    /// told to (test clocks).
    fn speed(&self) -> f64;
}

/// Convert a time expressed in `timescale` units to 180 kHz clock ticks.
pub const fn timescale_to_clock(time: i64, timescale: i64) -> i64 {
    convert_timescale(time, timescale, CLOCK_RATE)
}

/// Convert 180 kHz clock ticks to `timescale` units.
pub const fn clock_to_timescale(time: i64, timescale: i64) -> i64 {
    convert_timescale(time, CLOCK_RATE, timescale)
}

/// Rescale `time` from `src` units to `dst` units, rounding up.
pub const fn convert_timescale(time: i64, src: i64, dst: i64) -> i64 {
    div_up(time * dst, src)
}

/// Truncate a fractional time (seconds) to 180 kHz clock ticks.
#[allow(clippy::cast_possible_truncation)]
pub fn fraction_to_clock(f: Fraction) -> i64 {
    ((i128::from(f.num) * i128::from(CLOCK_RATE)) / i128::from(f.den)) as i64
}

/// Express 180 kHz clock ticks as a fractional time in seconds.
pub const fn clock_to_fraction(ticks: i64) -> Fraction {
    Fraction::new(ticks, CLOCK_RATE)
}

/// Wall-clock implementation: `(wall_time - t0) * speed`.
pub struct SystemClock {
    start: Instant,
    speed: f64,
}

impl SystemClock {
    pub fn new(speed: f64) -> Self {
        Self { start: Instant::now(), speed }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> Fraction {
        let elapsed_us = i64::try_from(self.start.elapsed().as_micros()).unwrap_or(i64::MAX);
        let scaled = (elapsed_us as f64 * self.speed) as i64;
        Fraction::new(scaled, 1_000_000).simplified()
    }

    fn speed(&self) -> f64 {
        self.speed
    }
}

/// Deterministic clock for tests: time only moves via [`TestClock::set_time`]
/// and never backwards.
pub struct TestClock {
    time: Mutex<Fraction>,
}

impl TestClock {
    pub fn new(start: Fraction) -> Self {
        Self { time: Mutex::new(start) }
    }

    /// Advance the clock. Earlier times are ignored, keeping `now()`
    /// monotonic no matter how tests interleave.
    pub fn set_time(&self, t: Fraction) {
        let mut cur = self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if t > *cur {
            *cur = t;
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(Fraction::new(0, 1))
    }
}

impl Clock for TestClock {
    fn now(&self) -> Fraction {
        *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn speed(&self) -> f64 {
        0.0
    }
}
