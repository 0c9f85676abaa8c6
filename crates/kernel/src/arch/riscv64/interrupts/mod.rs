//! Trap entry and dispatch.
//!
//! `sscratch` always holds the executing hart's [`CpuLocalStorage`] pointer,
//! whose first field is the trap save area. The entry stub spills every
//! register there, switches to the hart's trap stack when the trap came from
//! user mode, and hands the frame to [`trap_dispatch`]. Context switches
//! happen by rewriting the frame before the stub restores it.

pub mod plic;

use core::arch::naked_asm;
use core::fmt::Display;
use core::mem::offset_of;

use crate::{
    VirtAddr,
    arch::riscv64::{
        registers::{self, SSTATUS_SPP},
        sbi,
        threading::{CpuLocalStorage, CpuStatus, GpRegs, cpu_local, cpu_locals_ready},
        utils,
    },
};

// scause values
const CAUSE_INTERRUPT: usize = 1 << 63;
const IRQ_S_SOFT: usize = 1;
const IRQ_S_TIMER: usize = 5;
const IRQ_S_EXT: usize = 9;

const EXC_ILLEGAL_INSTRUCTION: usize = 2;
const EXC_ECALL_USER: usize = 8;
const EXC_INSTRUCTION_PAGE_FAULT: usize = 12;
const EXC_LOAD_PAGE_FAULT: usize = 13;
const EXC_STORE_PAGE_FAULT: usize = 15;

/// software-IPI mailbox bits
pub const IPI_TLB_SHOOTDOWN: u32 = 1 << 0;
pub const IPI_RESCHEDULE: u32 = 1 << 1;
pub const IPI_HALT: u32 = 1 << 2;

/// Everything the entry stub spills, in x1..x31 order, followed by the
/// control CSRs
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: GpRegs,
    pub sepc: VirtAddr,
    pub sstatus: u64,
    pub scause: u64,
    pub stval: u64,
}

impl TrapFrame {
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP as u64 == 0
    }

    pub fn save_into(&self, status: &mut CpuStatus) {
        status.regs = self.regs.clone();
        status.sepc = self.sepc;
        status.sstatus = self.sstatus;
    }

    pub fn load_from(&mut self, status: &CpuStatus) {
        self.regs = status.regs.clone();
        self.sepc = status.sepc;
        self.sstatus = status.sstatus;
    }

    /// syscall convention: number in a7, arguments in a0..a4
    pub fn syscall_args(&self) -> (u16, [usize; 5]) {
        (
            self.regs.a7 as u16,
            [
                self.regs.a0 as usize,
                self.regs.a1 as usize,
                self.regs.a2 as usize,
                self.regs.a3 as usize,
                self.regs.a4 as usize,
            ],
        )
    }

    pub fn set_syscall_ret(&mut self, value: isize) {
        self.regs.a0 = value as u64;
    }

    /// undoes the `ecall` skip so waking the task restarts the syscall
    pub fn rewind_syscall(&mut self) {
        self.sepc -= 4;
    }
}

impl Display for TrapFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "---- trap frame ----")?;
        writeln!(
            f,
            "scause {:#x}, stval {:#x}, at {:?}",
            self.scause, self.stval, self.sepc
        )?;
        write!(f, "sp: {:#x}, sstatus: {:#x}", self.regs.sp, self.sstatus)
    }
}

const FRAME_OFFSET: usize = offset_of!(CpuLocalStorage, trap_frame);
const STACK_OFFSET: usize = offset_of!(CpuLocalStorage, trap_stack_top);
// the stub assumes sscratch points straight at the frame
const _: () = assert!(FRAME_OFFSET == 0);

#[unsafe(naked)]
pub extern "C" fn trap_entry() {
    naked_asm!(
        // t6 <-> sscratch: t6 = frame, sscratch = original t6
        "csrrw t6, sscratch, t6",
        "sd ra, 0*8(t6)",
        "sd sp, 1*8(t6)",
        "sd gp, 2*8(t6)",
        "sd tp, 3*8(t6)",
        "sd t0, 4*8(t6)",
        "sd t1, 5*8(t6)",
        "sd t2, 6*8(t6)",
        "sd s0, 7*8(t6)",
        "sd s1, 8*8(t6)",
        "sd a0, 9*8(t6)",
        "sd a1, 10*8(t6)",
        "sd a2, 11*8(t6)",
        "sd a3, 12*8(t6)",
        "sd a4, 13*8(t6)",
        "sd a5, 14*8(t6)",
        "sd a6, 15*8(t6)",
        "sd a7, 16*8(t6)",
        "sd s2, 17*8(t6)",
        "sd s3, 18*8(t6)",
        "sd s4, 19*8(t6)",
        "sd s5, 20*8(t6)",
        "sd s6, 21*8(t6)",
        "sd s7, 22*8(t6)",
        "sd s8, 23*8(t6)",
        "sd s9, 24*8(t6)",
        "sd t3, 25*8(t6)",
        "sd t4, 26*8(t6)",
        "sd t5, 27*8(t6)",
        "sd s10, 28*8(t6)",
        "sd s11, 29*8(t6)",
        // recover the original t6 and park the frame pointer in sscratch again
        "csrrw t0, sscratch, t6",
        "sd t0, 30*8(t6)",
        "csrr t0, sepc",
        "sd t0, 31*8(t6)",
        "csrr t0, sstatus",
        "sd t0, 32*8(t6)",
        "csrr t0, scause",
        "sd t0, 33*8(t6)",
        "csrr t0, stval",
        "sd t0, 34*8(t6)",
        // user traps run on the hart's trap stack; kernel traps stay put
        "ld t0, 32*8(t6)",
        "li t1, {spp}",
        "and t0, t0, t1",
        "bnez t0, 2f",
        "ld sp, {stack_offset}(t6)",
        "2:",
        "mv a0, t6",
        "call {dispatch}",
        // restore from the (possibly rewritten) frame
        "csrr t6, sscratch",
        "ld t0, 31*8(t6)",
        "csrw sepc, t0",
        "ld t0, 32*8(t6)",
        "csrw sstatus, t0",
        "ld ra, 0*8(t6)",
        "ld sp, 1*8(t6)",
        "ld gp, 2*8(t6)",
        "ld tp, 3*8(t6)",
        "ld t0, 4*8(t6)",
        "ld t1, 5*8(t6)",
        "ld t2, 6*8(t6)",
        "ld s0, 7*8(t6)",
        "ld s1, 8*8(t6)",
        "ld a0, 9*8(t6)",
        "ld a1, 10*8(t6)",
        "ld a2, 11*8(t6)",
        "ld a3, 12*8(t6)",
        "ld a4, 13*8(t6)",
        "ld a5, 14*8(t6)",
        "ld a6, 15*8(t6)",
        "ld a7, 16*8(t6)",
        "ld s2, 17*8(t6)",
        "ld s3, 18*8(t6)",
        "ld s4, 19*8(t6)",
        "ld s5, 20*8(t6)",
        "ld s6, 21*8(t6)",
        "ld s7, 22*8(t6)",
        "ld s8, 23*8(t6)",
        "ld s9, 24*8(t6)",
        "ld t3, 25*8(t6)",
        "ld t4, 26*8(t6)",
        "ld t5, 27*8(t6)",
        "ld s10, 28*8(t6)",
        "ld s11, 29*8(t6)",
        "ld t6, 30*8(t6)",
        "sret",
        spp = const SSTATUS_SPP,
        stack_offset = const STACK_OFFSET,
        dispatch = sym trap_dispatch,
    )
}

/// installs the trap vector on the calling hart
pub unsafe fn init_hart_traps() {
    unsafe {
        registers::write_stvec(trap_entry as usize);
        registers::set_sstatus_bits(registers::SSTATUS_SUM);
        registers::set_sie_bits(registers::SIE_SSIE | registers::SIE_STIE | registers::SIE_SEIE);
    }
}

/// arms the next scheduler tick
pub fn arm_timer() {
    sbi::set_timer(registers::read_time() as u64 + utils::ticks_per_interval());
}

extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let cause = frame.scause as usize;

    if cause & CAUSE_INTERRUPT != 0 {
        match cause & !CAUSE_INTERRUPT {
            IRQ_S_TIMER => {
                arm_timer();
                crate::scheduler::timer_tick(frame);
            }
            IRQ_S_SOFT => handle_software_ipi(frame),
            IRQ_S_EXT => handle_external(),
            other => crate::warn!("unexpected interrupt cause {other}"),
        }
        return;
    }

    match cause {
        EXC_ECALL_USER => {
            // return past the ecall; a blocking handler rewinds this
            frame.sepc += 4;
            crate::syscalls::entry(frame);
        }
        EXC_INSTRUCTION_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT => {
            let fault_va = VirtAddr::from(frame.stval as usize);
            let write = cause == EXC_STORE_PAGE_FAULT;
            let exec = cause == EXC_INSTRUCTION_PAGE_FAULT;

            // the kernel touching a validated-but-lazy user buffer during a
            // syscall faults here too and resolves the same way
            let lazy_user_access = fault_va < crate::arch::paging::user_end()
                && crate::scheduler::SCHEDULER_INITED.load(core::sync::atomic::Ordering::Acquire);

            if frame.from_user() || lazy_user_access {
                crate::memory::address_space::handle_user_fault(frame, fault_va, write, exec);
            } else {
                panic!("kernel page fault at {fault_va:?}\n{frame}");
            }
        }
        EXC_ILLEGAL_INSTRUCTION if frame.from_user() => {
            use portal_abi::errors::ErrorStatus;
            crate::error!("user task hit an illegal instruction at {:?}", frame.sepc);
            crate::scheduler::kill_current(frame, ErrorStatus::BadInstruction);
        }
        other => panic!("unhandled trap {other}\n{frame}"),
    }
}

fn handle_software_ipi(frame: &mut TrapFrame) {
    unsafe {
        registers::clear_sip_bits(registers::SIE_SSIE);
    }
    if !cpu_locals_ready() {
        return;
    }

    let pending = cpu_local()
        .ipi_pending
        .swap(0, core::sync::atomic::Ordering::AcqRel);

    if pending & IPI_HALT != 0 {
        loop {
            unsafe { crate::arch::hlt() }
        }
    }
    if pending & IPI_TLB_SHOOTDOWN != 0 {
        crate::memory::tlb::handle_shootdown_ipi();
    }
    if pending & IPI_RESCHEDULE != 0 {
        crate::scheduler::reschedule_from_ipi(frame);
    }
}

fn handle_external() {
    let hart = crate::arch::cpu_index();
    loop {
        let source = plic::claim(hart);
        if source == 0 {
            break;
        }
        crate::interrupts::deliver(source);
        // completion happens on user acknowledgement; the source stays
        // gated by its claim until then
    }
}
