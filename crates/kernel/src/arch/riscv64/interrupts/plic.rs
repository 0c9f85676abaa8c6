//! The platform-level interrupt controller.
//!
//! Register layout of the SiFive-compatible PLIC QEMU's virt machine
//! carries; the base would come from the device tree on real boards. Each
//! hart's S-mode context is `1 + 2 * hart`.

use crate::PhysAddr;

const PLIC_BASE: usize = 0x0C00_0000;
/// sources the virt machine exposes
const SOURCE_COUNT: u32 = 96;

const fn context_of(hart: usize) -> usize {
    1 + 2 * hart
}

fn reg(offset: usize) -> *mut u32 {
    (PhysAddr::from(PLIC_BASE + offset).into_virt()).into_ptr()
}

fn priority_reg(source: u32) -> *mut u32 {
    reg(4 * source as usize)
}

fn enable_reg(hart: usize, source: u32) -> *mut u32 {
    reg(0x2000 + 0x80 * context_of(hart) + (source as usize / 32) * 4)
}

fn threshold_reg(hart: usize) -> *mut u32 {
    reg(0x20_0000 + 0x1000 * context_of(hart))
}

fn claim_reg(hart: usize) -> *mut u32 {
    reg(0x20_0004 + 0x1000 * context_of(hart))
}

pub fn source_count() -> u32 {
    SOURCE_COUNT
}

/// opens this hart's gate; individual sources stay disabled until a handler
/// is installed
pub unsafe fn init_hart(hart: usize) {
    unsafe {
        threshold_reg(hart).write_volatile(0);
    }
}

pub fn enable(source: u32, hart: usize) {
    unsafe {
        priority_reg(source).write_volatile(1);
        let enable = enable_reg(hart, source);
        let bit = 1 << (source % 32);
        enable.write_volatile(enable.read_volatile() | bit);
    }
}

pub fn disable(source: u32, hart: usize) {
    unsafe {
        let enable = enable_reg(hart, source);
        let bit = 1 << (source % 32);
        enable.write_volatile(enable.read_volatile() & !bit);
    }
}

/// next pending source for this hart, 0 if none
pub fn claim(hart: usize) -> u32 {
    unsafe { claim_reg(hart).read_volatile() }
}

/// signals the handler finished; the source can fire again
pub fn complete(hart: usize, source: u32) {
    unsafe {
        claim_reg(hart).write_volatile(source);
    }
}
