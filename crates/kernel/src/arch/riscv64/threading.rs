//! Per-hart storage, saved register state and SMP bring-up.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::boxed::Box;
use limine::mp::Cpu;
use spin::Once;

use crate::{
    VirtAddr,
    arch::riscv64::{
        interrupts::{self, TrapFrame},
        registers::{SSTATUS_SPIE, SSTATUS_SPP, write_sscratch},
    },
    memory::paging::PAGE_SIZE,
    scheduler::Scheduler,
};

/// x1..x31 in order, the layout the trap stub spills
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct GpRegs {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub s10: u64,
    pub s11: u64,
    pub t6: u64,
}

/// The saved CPU state of a task
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct CpuStatus {
    pub regs: GpRegs,
    pub sepc: VirtAddr,
    pub sstatus: u64,
}

impl CpuStatus {
    pub fn create(entry: VirtAddr, stack_top: VirtAddr, arg: usize, user: bool) -> Self {
        let mut sstatus = SSTATUS_SPIE as u64;
        if !user {
            sstatus |= SSTATUS_SPP as u64;
        }

        let mut status = Self {
            sepc: entry,
            sstatus,
            ..Default::default()
        };
        status.regs.sp = stack_top.into_raw() as u64;
        status.regs.a0 = arg as u64;
        status
    }

    pub fn at(&self) -> VirtAddr {
        self.sepc
    }

    pub fn stack_at(&self) -> VirtAddr {
        VirtAddr::from(self.regs.sp as usize)
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.regs.a0 = value;
    }
}

/// Enters a saved context for the first time on this hart by replaying it
/// through the trap frame and the stub's restore path.
///
/// # Safety
/// `status` must be a valid context whose address space is active.
pub unsafe fn restore_cpu_status(status: &CpuStatus) -> ! {
    let frame = &cpu_local().trap_frame as *const TrapFrame as *mut TrapFrame;
    unsafe {
        (*frame).load_from(status);
        asm!(
            // jump into trap_entry's restore half with sscratch -> frame
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
            options(noreturn),
        )
    }
}

const TRAP_STACK_SIZE: usize = PAGE_SIZE * 4;

/// Everything one hart owns. `sscratch` points here; the trap frame must
/// stay the first field (the stub spills straight through the pointer).
#[repr(C)]
pub struct CpuLocalStorage {
    pub trap_frame: TrapFrame,
    /// top of the hart's trap stack, entered on traps from user mode
    pub trap_stack_top: usize,
    pub cpu_index: usize,
    pub hart_id: u32,
    pub ipi_pending: AtomicU32,
    pub scheduler: Scheduler,
    _trap_stack: Box<[u8]>,
}

unsafe impl Send for CpuLocalStorage {}
unsafe impl Sync for CpuLocalStorage {}

static CPU_LOCALS: Once<Box<[&'static CpuLocalStorage]>> = Once::new();
static CPU_LOCALS_READY: AtomicBool = AtomicBool::new(false);

pub fn cpu_locals_ready() -> bool {
    CPU_LOCALS_READY.load(Ordering::Acquire)
}

#[inline]
pub fn cpu_local() -> &'static CpuLocalStorage {
    debug_assert!(cpu_locals_ready());
    unsafe {
        let ptr: *const CpuLocalStorage;
        asm!("csrr {}, sscratch", out(reg) ptr, options(nostack, preserves_flags));
        &*ptr
    }
}

pub fn cpu_locals() -> &'static [&'static CpuLocalStorage] {
    CPU_LOCALS.get().expect("per-CPU storage not initialized")
}

#[inline]
pub fn cpu_index() -> usize {
    if !cpu_locals_ready() {
        return 0;
    }
    cpu_local().cpu_index
}

unsafe fn install_sscratch(storage: &'static CpuLocalStorage) {
    unsafe {
        write_sscratch(storage as *const _ as usize);
    }
}

pub fn init_cpu_locals() {
    let response = *crate::limine::MP_RESPONSE;
    let bsp_hartid = response.bsp_hartid();

    let locals = CPU_LOCALS.call_once(|| {
        let mut locals = alloc::vec::Vec::new();
        for (index, cpu) in response.cpus().iter().enumerate() {
            let trap_stack = alloc::vec![0u8; TRAP_STACK_SIZE].into_boxed_slice();
            let stack_top = trap_stack.as_ptr() as usize + TRAP_STACK_SIZE;

            let storage: &'static mut CpuLocalStorage = Box::leak(Box::new(CpuLocalStorage {
                trap_frame: TrapFrame::default(),
                trap_stack_top: stack_top,
                cpu_index: index,
                hart_id: cpu.hartid as u32,
                ipi_pending: AtomicU32::new(0),
                scheduler: Scheduler::new(index),
                _trap_stack: trap_stack,
            }));
            cpu.extra
                .store(storage as *const _ as u64, Ordering::Release);
            locals.push(&*storage);
        }
        locals.into_boxed_slice()
    });

    let bsp = locals
        .iter()
        .find(|storage| storage.hart_id as u64 == bsp_hartid)
        .expect("boot hart missing from the MP response");

    unsafe {
        install_sscratch(bsp);
        interrupts::init_hart_traps();
        interrupts::plic::init_hart(bsp.cpu_index);
    }
    CPU_LOCALS_READY.store(true, Ordering::Release);
}

extern "C" fn ap_entry(cpu: &Cpu) -> ! {
    let storage = cpu.extra.load(Ordering::Acquire) as *const CpuLocalStorage;
    let storage: &'static CpuLocalStorage = unsafe { &*storage };

    unsafe {
        crate::arch::paging::activate(crate::arch::paging::kernel_root());
        install_sscratch(storage);
        interrupts::init_hart_traps();
        interrupts::plic::init_hart(storage.cpu_index);
    }
    interrupts::arm_timer();

    crate::debug!("cpu {} (hart {}) online", storage.cpu_index, storage.hart_id);
    crate::scheduler::enter_idle()
}

pub fn start_secondary_cpus() {
    let response = *crate::limine::MP_RESPONSE;
    let bsp_hartid = response.bsp_hartid();

    for cpu in response.cpus() {
        if cpu.hartid == bsp_hartid {
            continue;
        }
        cpu.goto_address.write(ap_entry);
    }
}

/// raises a software IPI carrying `bits` on another hart
pub fn post_ipi(cpu_index: usize, bits: u32) {
    let target = cpu_locals()[cpu_index];
    target.ipi_pending.fetch_or(bits, Ordering::AcqRel);
    super::sbi::send_ipi(1, target.hart_id as usize);
}
