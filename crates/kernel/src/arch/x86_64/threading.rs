//! Per-CPU storage, saved register state and SMP bring-up.

use core::arch::asm;
use core::cell::SyncUnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use limine::mp::Cpu;
use spin::Once;

use crate::{
    VirtAddr,
    arch::x86_64::{
        gdt::{Gdt, KERNEL_CODE_SEG, KERNEL_DATA_SEG, TaskStateSegment, USER_CODE_SEG, USER_DATA_SEG},
        interrupts,
        registers::{IA32_GS_BASE, wrmsr},
    },
    scheduler::Scheduler,
};

/// IF set, everything else clear
const RFLAGS_DEFAULT: u64 = 0x202;

/// General-purpose registers in the exact order the interrupt stubs push
/// them (r15 lands lowest)
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct GpRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// The saved CPU state of a task: the register block followed by an iretq
/// frame, so restoring is "point rsp here, pop, iretq"
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct CpuStatus {
    pub regs: GpRegs,
    pub rip: VirtAddr,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: VirtAddr,
    pub ss: u64,
}

impl CpuStatus {
    /// A fresh context entering `entry(arg)` on `stack_top`
    pub fn create(entry: VirtAddr, stack_top: VirtAddr, arg: usize, user: bool) -> Self {
        let (cs, ss) = if user {
            (USER_CODE_SEG as u64, USER_DATA_SEG as u64)
        } else {
            (KERNEL_CODE_SEG as u64, KERNEL_DATA_SEG as u64)
        };

        let mut status = Self {
            rip: entry,
            cs,
            rflags: RFLAGS_DEFAULT,
            rsp: stack_top,
            ss,
            ..Default::default()
        };
        status.regs.rdi = arg as u64;
        status
    }

    pub fn at(&self) -> VirtAddr {
        self.rip
    }

    pub fn stack_at(&self) -> VirtAddr {
        self.rsp
    }

    /// the syscall return register
    pub fn set_return_value(&mut self, value: u64) {
        self.regs.rax = value;
    }
}

/// Jumps into a saved context, never returning. Used once per CPU to enter
/// the first task; every later switch happens inside the interrupt stubs.
///
/// # Safety
/// `status` must be a valid context whose address space is active.
pub unsafe fn restore_cpu_status(status: &CpuStatus) -> ! {
    unsafe {
        asm!(
            "cli",
            "mov rsp, {status}",
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
            "iretq",
            status = in(reg) status as *const CpuStatus,
            options(noreturn),
        )
    }
}

/// Everything one CPU owns. Reached through the GS base, which user code can
/// neither read nor change (CR4.FSGSBASE stays off).
#[repr(C)]
pub struct CpuLocalStorage {
    /// must stay first: `cpu_local()` reads it through `gs:[0]`
    self_ref: *const CpuLocalStorage,
    pub cpu_index: usize,
    pub lapic_id: u32,
    pub scheduler: Scheduler,
    pub tss: SyncUnsafeCell<TaskStateSegment>,
    gdt: SyncUnsafeCell<Gdt>,
    /// ring-3 traps land here (TSS.rsp0)
    _interrupt_stack: alloc::boxed::Box<[u8]>,
    /// double faults get their own known-good stack (IST 1)
    _fault_stack: alloc::boxed::Box<[u8]>,
}

unsafe impl Send for CpuLocalStorage {}
unsafe impl Sync for CpuLocalStorage {}

static CPU_LOCALS: Once<Box<[&'static CpuLocalStorage]>> = Once::new();
static CPU_LOCALS_READY: AtomicBool = AtomicBool::new(false);

pub fn cpu_locals_ready() -> bool {
    CPU_LOCALS_READY.load(Ordering::Acquire)
}

/// The executing CPU's storage
#[inline]
pub fn cpu_local() -> &'static CpuLocalStorage {
    debug_assert!(cpu_locals_ready());
    unsafe {
        let ptr: *const CpuLocalStorage;
        asm!("mov {}, gs:[0]", out(reg) ptr, options(nostack, preserves_flags));
        &*ptr
    }
}

/// All CPUs' storages, for cross-CPU wakes and shootdowns
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

unsafe fn install_gs(storage: &'static CpuLocalStorage) {
    unsafe {
        wrmsr(IA32_GS_BASE, storage as *const _ as u64);
    }
}

/// Allocates one storage per CPU the bootloader reported and installs the
/// boot CPU's
pub fn init_cpu_locals() {
    let response = *crate::limine::MP_RESPONSE;
    let bsp_lapic_id = response.bsp_lapic_id();

    let locals = CPU_LOCALS.call_once(|| {
        const INTERRUPT_STACK_SIZE: usize = 4 * crate::memory::paging::PAGE_SIZE;

        let mut locals = alloc::vec::Vec::new();
        for (index, cpu) in response.cpus().iter().enumerate() {
            let interrupt_stack = alloc::vec![0u8; INTERRUPT_STACK_SIZE].into_boxed_slice();
            let fault_stack = alloc::vec![0u8; INTERRUPT_STACK_SIZE].into_boxed_slice();
            let rsp0 = interrupt_stack.as_ptr() as u64 + INTERRUPT_STACK_SIZE as u64;
            let ist1 = fault_stack.as_ptr() as u64 + INTERRUPT_STACK_SIZE as u64;

            let storage: &'static mut CpuLocalStorage = Box::leak(Box::new(CpuLocalStorage {
                self_ref: core::ptr::null(),
                cpu_index: index,
                lapic_id: cpu.lapic_id,
                scheduler: Scheduler::new(index),
                tss: SyncUnsafeCell::new(TaskStateSegment::new()),
                gdt: SyncUnsafeCell::new(Gdt::new()),
                _interrupt_stack: interrupt_stack,
                _fault_stack: fault_stack,
            }));
            storage.self_ref = storage;
            unsafe {
                let tss = &mut *storage.tss.get();
                tss.rsp0 = rsp0;
                tss.ist[0] = ist1;
            }
            cpu.extra
                .store(storage as *const _ as u64, Ordering::Release);
            locals.push(&*storage);
        }
        locals.into_boxed_slice()
    });

    let bsp = locals
        .iter()
        .find(|storage| storage.lapic_id == bsp_lapic_id)
        .expect("boot CPU missing from the MP response");

    unsafe {
        install_gs(bsp);
        // switch the boot CPU from the static boot tables to its own
        (*bsp.gdt.get()).load(&*bsp.tss.get());
        interrupts::load_idt();
    }
    CPU_LOCALS_READY.store(true, Ordering::Release);
}

extern "C" fn ap_entry(cpu: &Cpu) -> ! {
    let storage = cpu.extra.load(Ordering::Acquire) as *const CpuLocalStorage;
    let storage: &'static CpuLocalStorage = unsafe { &*storage };

    unsafe {
        // limine parked us on its own tables; move to the kernel root
        crate::arch::paging::activate(crate::arch::paging::kernel_root());
        install_gs(storage);
        (*storage.gdt.get()).load(&*storage.tss.get());
        interrupts::load_idt();
        interrupts::apic::init_local();
    }
    interrupts::apic::start_timer();

    crate::debug!("cpu {} (lapic {}) online", storage.cpu_index, storage.lapic_id);
    crate::scheduler::enter_idle()
}

/// Kicks every secondary CPU through the limine MP protocol
pub fn start_secondary_cpus() {
    let response = *crate::limine::MP_RESPONSE;
    let bsp_lapic_id = response.bsp_lapic_id();

    for cpu in response.cpus() {
        if cpu.lapic_id == bsp_lapic_id {
            continue;
        }
        cpu.goto_address.write(ap_entry);
    }
}
