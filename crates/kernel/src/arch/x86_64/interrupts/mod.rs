//! Interrupt entry and dispatch.
//!
//! Every vector funnels through one common stub that materializes an
//! [`IsrContext`] on the stack; the dispatcher routes it to the right
//! subsystem and the stub restores whatever the context holds afterwards,
//! which is how context switches happen on this architecture.

pub mod apic;
mod idt;
pub mod ioapic;

use core::arch::{asm, naked_asm};
use core::fmt::Display;

use crate::arch::x86_64::serial::outb;
use crate::arch::x86_64::threading::{CpuStatus, GpRegs};
use crate::VirtAddr;

use idt::{GateDescriptor, IDT};

// vector map
pub const VECTOR_TIMER: u8 = 0x20;
/// GSIs 0..64 land on 0x30..0x70
pub const VECTOR_GSI_BASE: u8 = 0x30;
pub const GSI_COUNT: u32 = 64;
pub const VECTOR_SYSCALL: u8 = 0x80;
pub const VECTOR_TLB_SHOOTDOWN: u8 = 0xF0;
pub const VECTOR_RESCHEDULE: u8 = 0xF1;
pub const VECTOR_HALT: u8 = 0xF2;
/// software-raised only (no EOI): voluntary yields from kernel code
pub const VECTOR_YIELD: u8 = 0xF3;
pub const VECTOR_SPURIOUS: u8 = 0xFF;

/// What the CPU pushed, plus what the common stub pushed on top
#[derive(Debug, Clone)]
#[repr(C)]
pub struct IsrContext {
    pub regs: GpRegs,
    pub vector: u64,
    pub error_code: u64,
    pub rip: VirtAddr,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: VirtAddr,
    pub ss: u64,
}

impl IsrContext {
    pub fn from_user(&self) -> bool {
        self.cs & 3 != 0
    }

    pub fn save_into(&self, status: &mut CpuStatus) {
        status.regs = self.regs.clone();
        status.rip = self.rip;
        status.cs = self.cs;
        status.rflags = self.rflags;
        status.rsp = self.rsp;
        status.ss = self.ss;
    }

    pub fn load_from(&mut self, status: &CpuStatus) {
        self.regs = status.regs.clone();
        self.rip = status.rip;
        self.cs = status.cs;
        self.rflags = status.rflags;
        self.rsp = status.rsp;
        self.ss = status.ss;
    }

    /// syscall convention: number in rax, arguments in rdi, rsi, rdx, r10, r8
    pub fn syscall_args(&self) -> (u16, [usize; 5]) {
        (
            self.regs.rax as u16,
            [
                self.regs.rdi as usize,
                self.regs.rsi as usize,
                self.regs.rdx as usize,
                self.regs.r10 as usize,
                self.regs.r8 as usize,
            ],
        )
    }

    pub fn set_syscall_ret(&mut self, value: isize) {
        self.regs.rax = value as u64;
    }

    /// Re-points the task at the `int 0x80` it came from, so waking it
    /// restarts the syscall at the faulting instruction
    pub fn rewind_syscall(&mut self) {
        self.rip -= 2;
    }
}

impl Display for IsrContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "---- interrupt context ----")?;
        writeln!(
            f,
            "vector {:#x}, error code {:#x}, at {:?}",
            self.vector, self.error_code, self.rip
        )?;
        writeln!(f, "rsp: {:?}, rflags: {:#x}", self.rsp, self.rflags)?;
        write!(f, "cs: {:#x}, ss: {:#x}", self.cs, self.ss)
    }
}

#[unsafe(naked)]
extern "C" fn isr_common() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16", // vector + error code
        "iretq",
        dispatch = sym isr_dispatch,
    )
}

macro_rules! isr_stub {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector as u64,
                common = sym isr_common,
            )
        }
    };
    ($name:ident, $vector:expr, has_error_code) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector as u64,
                common = sym isr_common,
            )
        }
    };
}

isr_stub!(isr_divide, 0x00);
isr_stub!(isr_debug, 0x01);
isr_stub!(isr_nmi, 0x02);
isr_stub!(isr_breakpoint, 0x03);
isr_stub!(isr_overflow, 0x04);
isr_stub!(isr_bound, 0x05);
isr_stub!(isr_invalid_opcode, 0x06);
isr_stub!(isr_device_na, 0x07);
isr_stub!(isr_double_fault, 0x08, has_error_code);
isr_stub!(isr_invalid_tss, 0x0A, has_error_code);
isr_stub!(isr_segment_np, 0x0B, has_error_code);
isr_stub!(isr_stack_fault, 0x0C, has_error_code);
isr_stub!(isr_gp_fault, 0x0D, has_error_code);
isr_stub!(isr_page_fault, 0x0E, has_error_code);
isr_stub!(isr_fp_error, 0x10);
isr_stub!(isr_alignment, 0x11, has_error_code);
isr_stub!(isr_machine_check, 0x12);
isr_stub!(isr_simd, 0x13);

isr_stub!(isr_timer, VECTOR_TIMER);
isr_stub!(isr_syscall, VECTOR_SYSCALL);
isr_stub!(isr_tlb_shootdown, VECTOR_TLB_SHOOTDOWN);
isr_stub!(isr_reschedule, VECTOR_RESCHEDULE);
isr_stub!(isr_halt, VECTOR_HALT);
isr_stub!(isr_yield, VECTOR_YIELD);
isr_stub!(isr_spurious, VECTOR_SPURIOUS);

/// one stub per routable GSI vector; they only differ in the pushed vector
macro_rules! gsi_stubs {
    ($($name:ident = $idx:literal),+ $(,)?) => {
        $(isr_stub!($name, VECTOR_GSI_BASE + $idx);)+
        const GSI_STUBS: [extern "C" fn(); GSI_COUNT as usize] = [$($name),+];
    };
}

gsi_stubs!(
    isr_gsi_0 = 0, isr_gsi_1 = 1, isr_gsi_2 = 2, isr_gsi_3 = 3,
    isr_gsi_4 = 4, isr_gsi_5 = 5, isr_gsi_6 = 6, isr_gsi_7 = 7,
    isr_gsi_8 = 8, isr_gsi_9 = 9, isr_gsi_10 = 10, isr_gsi_11 = 11,
    isr_gsi_12 = 12, isr_gsi_13 = 13, isr_gsi_14 = 14, isr_gsi_15 = 15,
    isr_gsi_16 = 16, isr_gsi_17 = 17, isr_gsi_18 = 18, isr_gsi_19 = 19,
    isr_gsi_20 = 20, isr_gsi_21 = 21, isr_gsi_22 = 22, isr_gsi_23 = 23,
    isr_gsi_24 = 24, isr_gsi_25 = 25, isr_gsi_26 = 26, isr_gsi_27 = 27,
    isr_gsi_28 = 28, isr_gsi_29 = 29, isr_gsi_30 = 30, isr_gsi_31 = 31,
    isr_gsi_32 = 32, isr_gsi_33 = 33, isr_gsi_34 = 34, isr_gsi_35 = 35,
    isr_gsi_36 = 36, isr_gsi_37 = 37, isr_gsi_38 = 38, isr_gsi_39 = 39,
    isr_gsi_40 = 40, isr_gsi_41 = 41, isr_gsi_42 = 42, isr_gsi_43 = 43,
    isr_gsi_44 = 44, isr_gsi_45 = 45, isr_gsi_46 = 46, isr_gsi_47 = 47,
    isr_gsi_48 = 48, isr_gsi_49 = 49, isr_gsi_50 = 50, isr_gsi_51 = 51,
    isr_gsi_52 = 52, isr_gsi_53 = 53, isr_gsi_54 = 54, isr_gsi_55 = 55,
    isr_gsi_56 = 56, isr_gsi_57 = 57, isr_gsi_58 = 58, isr_gsi_59 = 59,
    isr_gsi_60 = 60, isr_gsi_61 = 61, isr_gsi_62 = 62, isr_gsi_63 = 63,
);

/// Fills the IDT and loads it on the calling CPU
pub unsafe fn init_idt() {
    let idt = unsafe { &mut *IDT.get() };

    let entries: &[(u8, extern "C" fn())] = &[
        (0x00, isr_divide),
        (0x01, isr_debug),
        (0x02, isr_nmi),
        (0x03, isr_breakpoint),
        (0x04, isr_overflow),
        (0x05, isr_bound),
        (0x06, isr_invalid_opcode),
        (0x07, isr_device_na),
        (0x0A, isr_invalid_tss),
        (0x0B, isr_segment_np),
        (0x0C, isr_stack_fault),
        (0x0D, isr_gp_fault),
        (0x0E, isr_page_fault),
        (0x10, isr_fp_error),
        (0x11, isr_alignment),
        (0x12, isr_machine_check),
        (0x13, isr_simd),
        (VECTOR_TIMER, isr_timer),
        (VECTOR_TLB_SHOOTDOWN, isr_tlb_shootdown),
        (VECTOR_RESCHEDULE, isr_reschedule),
        (VECTOR_HALT, isr_halt),
        (VECTOR_YIELD, isr_yield),
        (VECTOR_SPURIOUS, isr_spurious),
    ];

    for &(vector, stub) in entries {
        idt.entries[vector as usize] = GateDescriptor::interrupt(stub as usize);
    }

    idt.entries[0x08] = GateDescriptor::with_ist(isr_double_fault as usize, 1);
    idt.entries[VECTOR_SYSCALL as usize] = GateDescriptor::user_interrupt(isr_syscall as usize);

    for (i, &stub) in GSI_STUBS.iter().enumerate() {
        idt.entries[VECTOR_GSI_BASE as usize + i] = GateDescriptor::interrupt(stub as usize);
    }

    unsafe { idt::load() };
}

/// loads the already-populated IDT on a secondary CPU
pub unsafe fn load_idt() {
    unsafe { idt::load() };
}

/// The legacy PIC powers up routing IRQs over vectors 0x08..0x0F; remap and
/// mask it so it can never alias our exceptions.
pub unsafe fn disable_legacy_pic() {
    unsafe {
        outb(0x20, 0x11);
        outb(0xA0, 0x11);
        outb(0x21, 0x20);
        outb(0xA1, 0x28);
        outb(0x21, 0x04);
        outb(0xA1, 0x02);
        outb(0x21, 0x01);
        outb(0xA1, 0x01);
        outb(0x21, 0xFF);
        outb(0xA1, 0xFF);
    }
}

fn read_cr2() -> VirtAddr {
    let cr2: usize;
    unsafe {
        asm!("mov {}, cr2", out(reg) cr2, options(nostack, preserves_flags));
    }
    VirtAddr::from(cr2)
}

extern "C" fn isr_dispatch(ctx: &mut IsrContext) {
    match ctx.vector as u8 {
        0x0E => handle_page_fault(ctx),
        vector if vector < 0x20 => handle_exception(ctx),
        VECTOR_TIMER => {
            apic::eoi();
            crate::scheduler::timer_tick(ctx);
        }
        VECTOR_SYSCALL => crate::syscalls::entry(ctx),
        VECTOR_TLB_SHOOTDOWN => {
            apic::eoi();
            crate::memory::tlb::handle_shootdown_ipi();
        }
        VECTOR_RESCHEDULE => {
            apic::eoi();
            crate::scheduler::reschedule_from_ipi(ctx);
        }
        VECTOR_YIELD => crate::scheduler::reschedule_from_ipi(ctx),
        VECTOR_HALT => loop {
            unsafe { crate::arch::hlt() }
        },
        VECTOR_SPURIOUS => {}
        vector if (VECTOR_GSI_BASE..VECTOR_GSI_BASE + GSI_COUNT as u8).contains(&vector) => {
            let gsi = (vector - VECTOR_GSI_BASE) as u32;
            crate::interrupts::deliver(gsi);
            apic::eoi();
        }
        vector => {
            crate::warn!("unexpected interrupt vector {vector:#x}");
            apic::eoi();
        }
    }
}

/// Page faults inside user-addressable space go to the region layer: user
/// accesses, and equally the kernel touching a validated-but-lazy user
/// buffer during a syscall. Faults on kernel addresses are fatal.
fn handle_page_fault(ctx: &mut IsrContext) {
    let fault_va = read_cr2();
    let write = ctx.error_code & (1 << 1) != 0;
    let exec = ctx.error_code & (1 << 4) != 0;

    let lazy_user_access = fault_va < crate::arch::paging::user_end()
        && crate::scheduler::SCHEDULER_INITED.load(core::sync::atomic::Ordering::Acquire);

    if ctx.from_user() || lazy_user_access {
        crate::memory::address_space::handle_user_fault(ctx, fault_va, write, exec);
    } else {
        panic!(
            "kernel page fault at {:?} (write: {}, exec: {})\n{}",
            fault_va, write, exec, ctx
        );
    }
}

fn handle_exception(ctx: &mut IsrContext) {
    const NAMES: [&str; 32] = [
        "divide error",
        "debug",
        "non-maskable interrupt",
        "breakpoint",
        "overflow",
        "bound range",
        "invalid opcode",
        "device not available",
        "double fault",
        "coprocessor overrun",
        "invalid TSS",
        "segment not present",
        "stack-segment fault",
        "general protection fault",
        "page fault",
        "reserved",
        "x87 error",
        "alignment check",
        "machine check",
        "SIMD exception",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
        "reserved",
    ];
    let name = NAMES[(ctx.vector as usize).min(31)];

    if ctx.from_user() {
        use portal_abi::errors::ErrorStatus;
        let reason = match ctx.vector as u8 {
            0x06 => ErrorStatus::BadInstruction,
            0x07 => ErrorStatus::InstructionUnavailable,
            _ => ErrorStatus::Generic,
        };
        crate::error!(
            "user task hit {name} at {:?}, killing it ({reason:?})",
            ctx.rip
        );
        crate::scheduler::kill_current(ctx, reason);
    } else {
        panic!("kernel exception: {name}\n{ctx}");
    }
}
