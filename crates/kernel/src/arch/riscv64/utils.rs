//! Time keeping: the `time` CSR counts at the platform timebase frequency,
//! taken from the device tree (QEMU virt's 10 MHz until discovery runs).

use core::sync::atomic::{AtomicU64, Ordering};

use super::registers::read_time;

/// milliseconds per scheduler tick
pub const TICK_MS: u64 = 10;

static TIMEBASE_FREQ: AtomicU64 = AtomicU64::new(10_000_000);

pub(super) fn set_timebase_freq(freq: u64) {
    TIMEBASE_FREQ.store(freq, Ordering::Relaxed);
}

#[inline]
pub(super) fn timebase_freq() -> u64 {
    TIMEBASE_FREQ.load(Ordering::Relaxed)
}

#[inline]
pub fn time_ms() -> u64 {
    read_time() as u64 / (timebase_freq() / 1000)
}

#[inline]
pub fn time_us() -> u64 {
    read_time() as u64 / (timebase_freq() / 1_000_000).max(1)
}

/// ticks of the `time` CSR per scheduler interval
#[inline]
pub(super) fn ticks_per_interval() -> u64 {
    timebase_freq() / 1000 * TICK_MS
}

/// the `time` CSR is the clock here; the scheduler tick has nothing to add
#[inline]
pub(crate) fn tick() {}
