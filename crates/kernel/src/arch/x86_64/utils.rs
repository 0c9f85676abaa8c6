//! Time keeping: the local APIC timer ticks at [`TICK_MS`] per CPU; the boot
//! CPU's tick counter is the system clock.

use core::sync::atomic::{AtomicU64, Ordering};

/// milliseconds per timer tick
pub const TICK_MS: u64 = 10;

pub(super) static BOOT_TICKS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn time_ms() -> u64 {
    BOOT_TICKS.load(Ordering::Relaxed) * TICK_MS
}

#[inline]
pub fn time_us() -> u64 {
    time_ms() * 1000
}

/// advances the system clock; the boot CPU's timer interrupt calls this
#[inline]
pub(crate) fn tick() {
    BOOT_TICKS.fetch_add(1, Ordering::Relaxed);
}
