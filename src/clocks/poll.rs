//! Time sources and the bounded status poll.

use embedded_hal_1::delay::DelayNs;

/// Max core clock is 48 MHz, so that's 48 clock ticks per microsecond.
pub const WORST_CASE_TICKS_PER_US: u32 = 48;

/// A free-running microsecond counter used to bound status polls.
///
/// The value may wrap; only differences are used.
pub trait TimeSource {
    /// Current time in microseconds.
    fn now_us(&mut self) -> u32;
}

/// Busy-wait time source for bare metal without a timer.
///
/// Every call to [`now_us`](TimeSource::now_us) burns one microsecond worth of
/// cycles, assuming the core runs no faster than `ticks_per_us`.
#[derive(Debug)]
pub struct SpinTimer {
    ticks_per_us: u32,
    elapsed_us: u32,
}

impl SpinTimer {
    /// Timer calibrated for `ticks_per_us` core cycles per microsecond.
    pub const fn new(ticks_per_us: u32) -> Self {
        Self {
            ticks_per_us,
            elapsed_us: 0,
        }
    }
}

impl Default for SpinTimer {
    fn default() -> Self {
        Self::new(WORST_CASE_TICKS_PER_US)
    }
}

impl TimeSource for SpinTimer {
    fn now_us(&mut self) -> u32 {
        cortex_m::asm::delay(self.ticks_per_us);
        self.elapsed_us = self.elapsed_us.wrapping_add(1);
        self.elapsed_us
    }
}

/// Adapts any embedded-hal delay provider into a [`TimeSource`].
#[derive(Debug)]
pub struct Delayed<D> {
    delay: D,
    elapsed_us: u32,
}

impl<D: DelayNs> Delayed<D> {
    /// Wrap `delay`.
    pub fn new(delay: D) -> Self {
        Self { delay, elapsed_us: 0 }
    }

    /// Give the delay provider back.
    pub fn release(self) -> D {
        self.delay
    }
}

impl<D: DelayNs> TimeSource for Delayed<D> {
    fn now_us(&mut self) -> u32 {
        self.delay.delay_us(1);
        self.elapsed_us = self.elapsed_us.wrapping_add(1);
        self.elapsed_us
    }
}

impl<T: TimeSource + ?Sized> TimeSource for &mut T {
    fn now_us(&mut self) -> u32 {
        (**self).now_us()
    }
}

/// Poll `done` until it returns `true` or `timeout_us` has elapsed.
///
/// `done` is always sampled once more after the deadline, so a condition
/// that becomes true exactly at the bound is not reported as a timeout.
pub fn wait_until<T, F>(time: &mut T, timeout_us: u32, mut done: F) -> bool
where
    T: TimeSource + ?Sized,
    F: FnMut() -> bool,
{
    let start = time.now_us();
    loop {
        if done() {
            return true;
        }
        if time.now_us().wrapping_sub(start) >= timeout_us {
            return done();
        }
    }
}
