//! Architecture specific code: bring-up, paging primitives, trap entry,
//! per-CPU storage and context switching.
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        use x86_64 as arch;
        pub type TrapContext = x86_64::interrupts::IsrContext;
    } else if #[cfg(target_arch = "riscv64")] {
        pub mod riscv64;
        use riscv64 as arch;
        pub type TrapContext = riscv64::interrupts::TrapFrame;
    } else {
        compile_error!("unsupported architecture (target_arch unsupported)");
    }
}

/// Everything related to threading: saved contexts, per-CPU storage, SMP
pub mod threading {
    pub use super::arch::threading::{
        CpuLocalStorage, CpuStatus, cpu_local, cpu_locals, cpu_locals_ready, init_cpu_locals,
        restore_cpu_status, start_secondary_cpus,
    };
}

pub use arch::{
    cpu_count, cpu_index, disable_interrupts, enable_interrupts, halt_all, hlt, init_phase1,
    init_phase2, interrupts_enabled, trigger_reschedule, without_interrupts,
};

pub mod power {
    pub use super::arch::power::{reboot, shutdown};
}

pub mod serial {
    pub use super::arch::serial::{_serial, SERIAL};
}

pub mod utils {
    pub use super::arch::utils::{TICK_MS, time_ms, time_us};
    pub(crate) use super::arch::utils::tick;
}

pub mod registers {
    pub use super::arch::registers::StackFrame;
}

/// Interrupt-controller control surface used by the interrupt router
pub mod intctl {
    pub use super::arch::intctl::{begin_handling, complete_gsi, gsi_limit, mask_gsi, unmask_gsi};
}

/// Cross-CPU interrupt senders used by the scheduler and the TLB layer
pub mod ipi {
    pub use super::arch::ipi::{send_reschedule, send_tlb_shootdown};
}

pub use arch::paging;
