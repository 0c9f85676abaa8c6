pub mod interrupts;
pub mod paging;
pub mod power;
pub mod registers;
pub mod sbi;
pub mod serial;
pub mod threading;
pub mod utils;

use core::arch::asm;

/// Waits for the next interrupt
/// # Safety
/// must not be called while holding a lock an interrupt handler takes
pub unsafe fn hlt() {
    unsafe { asm!("wfi", options(nomem, nostack)) }
}

pub unsafe fn disable_interrupts() {
    unsafe { registers::clear_sstatus_bits(registers::SSTATUS_SIE) }
}

pub unsafe fn enable_interrupts() {
    unsafe { registers::set_sstatus_bits(registers::SSTATUS_SIE) }
}

pub fn interrupts_enabled() -> bool {
    registers::read_sstatus() & registers::SSTATUS_SIE != 0
}

pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let were_enabled = interrupts_enabled();
    unsafe {
        disable_interrupts();
    }
    let result = f();
    if were_enabled {
        unsafe {
            enable_interrupts();
        }
    }
    result
}

pub fn halt_all() {
    if threading::cpu_locals_ready() {
        let current = cpu_index();
        for storage in threading::cpu_locals() {
            if storage.cpu_index != current {
                threading::post_ipi(storage.cpu_index, interrupts::IPI_HALT);
            }
        }
    }
}

/// Pre-memory bring-up: the SBI console needs nothing, traps come later
pub fn init_phase1() {
    serial::init();
}

/// Post-memory bring-up: device-tree discovery, traps, per-CPU storage, the
/// timer and the other harts
pub fn init_phase2() {
    discover_from_dtb();
    threading::init_cpu_locals();
    interrupts::arm_timer();
    threading::start_secondary_cpus();
}

/// Pulls the timebase frequency and the `svpbmt` extension flag out of the
/// device tree the bootloader handed over
fn discover_from_dtb() {
    let Some(dtb_ptr) = crate::limine::device_tree_addr() else {
        crate::warn!("no device tree; keeping QEMU defaults");
        return;
    };

    let Ok(dtb) = (unsafe { hermit_dtb::Dtb::from_raw(dtb_ptr.cast()) }) else {
        crate::warn!("device tree unreadable; keeping QEMU defaults");
        return;
    };

    if let Some(freq) = dtb.get_property("/cpus", "timebase-frequency") {
        let mut raw = [0u8; 4];
        if freq.len() >= 4 {
            raw.copy_from_slice(&freq[..4]);
            utils::set_timebase_freq(u32::from_be_bytes(raw) as u64);
        }
    }

    if let Some(isa) = dtb.get_property("/cpus/cpu@0", "riscv,isa")
        && let Ok(isa) = core::str::from_utf8(isa)
        && isa.contains("svpbmt")
    {
        paging::set_svpbmt_available();
    }
}

#[inline]
pub fn cpu_count() -> usize {
    crate::limine::MP_RESPONSE.cpus().len()
}

#[inline]
pub fn cpu_index() -> usize {
    threading::cpu_index()
}

/// Voluntary yield: raises a software interrupt on this hart so the switch
/// happens in the ordinary trap path
pub fn trigger_reschedule() {
    use core::sync::atomic::Ordering;

    threading::cpu_local()
        .ipi_pending
        .fetch_or(interrupts::IPI_RESCHEDULE, Ordering::AcqRel);
    unsafe {
        core::arch::asm!("csrs sip, {}", in(reg) registers::SIE_SSIE, options(nostack, preserves_flags));
    }
}

/// What the interrupt router needs from the PLIC
pub mod intctl {
    use super::interrupts::plic;

    pub fn gsi_limit() -> u32 {
        plic::source_count()
    }

    pub fn unmask_gsi(gsi: u32, cpu_index: usize) {
        plic::enable(gsi, cpu_index);
    }

    pub fn mask_gsi(gsi: u32) {
        // sources are enabled per hart; disabling on the routed hart is done
        // by the router, which always routes where it installed
        plic::disable(gsi, super::cpu_index());
    }

    /// the claim taken in the external-interrupt path already gates the
    /// source until completion
    pub fn begin_handling(_gsi: u32) {}

    pub fn complete_gsi(gsi: u32, cpu_index: usize) {
        plic::complete(cpu_index, gsi);
    }
}

pub mod ipi {
    use super::interrupts::{IPI_RESCHEDULE, IPI_TLB_SHOOTDOWN};
    use super::threading::post_ipi;

    pub fn send_reschedule(cpu_index: usize) {
        post_ipi(cpu_index, IPI_RESCHEDULE);
    }

    pub fn send_tlb_shootdown(cpu_index: usize) {
        post_ipi(cpu_index, IPI_TLB_SHOOTDOWN);
    }
}
