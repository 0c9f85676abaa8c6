//! The local APIC: timer, EOI and inter-processor interrupts.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::{
    PhysAddr,
    arch::x86_64::{
        registers::{IA32_APIC_BASE, rdmsr},
        serial::{inb, outb},
        utils::TICK_MS,
    },
};

use super::{VECTOR_HALT, VECTOR_SPURIOUS, VECTOR_TIMER};

// xAPIC MMIO register offsets
const REG_ID: usize = 0x20;
const REG_EOI: usize = 0xB0;
const REG_SVR: usize = 0xF0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

const TIMER_PERIODIC: u32 = 1 << 17;
const DIVIDE_BY_16: u32 = 0b0011;

static LAPIC_BASE: AtomicUsize = AtomicUsize::new(0);
/// APIC timer ticks per [`TICK_MS`] interval, measured once on the boot CPU
static TIMER_TICKS_PER_INTERVAL: AtomicU32 = AtomicU32::new(0);

fn lapic_ptr(offset: usize) -> *mut u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    debug_assert!(base != 0, "local APIC touched before init");
    (PhysAddr::from(base).into_virt() + offset).into_ptr()
}

fn read(offset: usize) -> u32 {
    unsafe { lapic_ptr(offset).read_volatile() }
}

fn write(offset: usize, value: u32) {
    unsafe { lapic_ptr(offset).write_volatile(value) }
}

/// the executing CPU's APIC id
pub fn lapic_id() -> u32 {
    read(REG_ID) >> 24
}

pub fn eoi() {
    write(REG_EOI, 0);
}

/// Enables the local APIC of the calling CPU (both the boot CPU and every
/// secondary one run this)
pub unsafe fn init_local() {
    if LAPIC_BASE.load(Ordering::Relaxed) == 0 {
        let base = unsafe { rdmsr(IA32_APIC_BASE) } as usize & !0xFFF;
        LAPIC_BASE.store(base, Ordering::Relaxed);
    }

    // software enable + spurious vector
    write(REG_SVR, 0x100 | VECTOR_SPURIOUS as u32);
}

/// Measures the APIC timer against the PIT once, then starts the periodic
/// tick on the calling CPU
pub fn calibrate_timer() {
    if TIMER_TICKS_PER_INTERVAL.load(Ordering::Relaxed) == 0 {
        write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
        write(REG_TIMER_INITIAL, u32::MAX);

        pit_wait_ms(TICK_MS as u16);

        let elapsed = u32::MAX - read(REG_TIMER_CURRENT);
        write(REG_TIMER_INITIAL, 0);
        TIMER_TICKS_PER_INTERVAL.store(elapsed.max(1), Ordering::Relaxed);

        crate::debug!("APIC timer: {elapsed} ticks per {TICK_MS}ms");
    }

    start_timer();
}

/// starts the periodic scheduler tick on the calling CPU
pub fn start_timer() {
    let interval = TIMER_TICKS_PER_INTERVAL.load(Ordering::Relaxed);
    debug_assert!(interval != 0, "timer started before calibration");

    write(REG_TIMER_DIVIDE, DIVIDE_BY_16);
    write(REG_LVT_TIMER, TIMER_PERIODIC | VECTOR_TIMER as u32);
    write(REG_TIMER_INITIAL, interval);
}

/// busy-waits `ms` using PIT channel 2 under the speaker gate
fn pit_wait_ms(ms: u16) {
    const PIT_HZ: u32 = 1_193_182;
    let count = (PIT_HZ / 1000 * ms as u32) as u16;

    unsafe {
        // gate channel 2, speaker off
        let gate = inb(0x61) & 0xFD | 0x01;
        outb(0x61, gate);
        // channel 2, lo/hi, one-shot
        outb(0x43, 0xB0);
        outb(0x42, count as u8);
        outb(0x42, (count >> 8) as u8);

        while inb(0x61) & 0x20 == 0 {
            core::hint::spin_loop();
        }
    }
}

fn send_ipi_raw(high: u32, low: u32) {
    write(REG_ICR_HIGH, high);
    write(REG_ICR_LOW, low);
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

/// fixed-vector IPI to one CPU by APIC id
pub fn send_ipi(lapic_id: u32, vector: u8) {
    send_ipi_raw(lapic_id << 24, vector as u32);
}

/// fixed-vector IPI to every CPU but the caller
pub fn broadcast_ipi(vector: u8) {
    // destination shorthand: all excluding self
    send_ipi_raw(0, (0b11 << 18) | vector as u32);
}

pub fn broadcast_halt() {
    broadcast_ipi(VECTOR_HALT);
}
