//! Task descriptors: the unit of execution the scheduler deals in.

pub mod group;

use core::cell::SyncUnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::{sync::Arc, sync::Weak, vec::Vec};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use portal_abi::{errors::ErrorStatus, task::RawTaskPriority};

use crate::{
    VirtAddr,
    arch::threading::CpuStatus,
    memory::{
        address_space::AddressSpace,
        frame_allocator::{self, AllocPolicy, Frame},
        mem_object::MemObject,
        paging::PAGE_SIZE,
    },
    utils::{
        locks::{RwLock, SpinLock, SpinLockGuard},
        types::Name,
    },
};

use group::TaskGroup;

pub type Tid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
    Background,
}

impl TaskPriority {
    /// ready-queue index, highest first
    pub const fn queue_index(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
            Self::Background => 3,
        }
    }

    /// Scheduler ticks a full slice lasts; background tasks have no quantum
    /// and run until they yield or something better shows up
    pub const fn quantum_ticks(&self) -> u32 {
        match self {
            Self::High => 2,
            Self::Normal => 4,
            Self::Low => 8,
            Self::Background => u32::MAX,
        }
    }
}

impl From<RawTaskPriority> for TaskPriority {
    fn from(value: RawTaskPriority) -> Self {
        match value {
            RawTaskPriority::Default | RawTaskPriority::Normal => Self::Normal,
            RawTaskPriority::High => Self::High,
            RawTaskPriority::Low => Self::Low,
            RawTaskPriority::Background => Self::Background,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BlockReason {
    /// a blocking receive; `deadline_ms` of 0 means no deadline
    OnPort { port: u64, deadline_ms: u64 },
    /// parked until a backing object materializes the page at `va`
    OnPage { va: VirtAddr },
    Sleeping { until_ms: u64 },
}

impl BlockReason {
    /// deadline-driven blocks lift themselves; the rest need an explicit wake
    pub fn block_lifted(&self) -> bool {
        match self {
            Self::Sleeping { until_ms } => crate::time!(ms) >= *until_ms,
            Self::OnPort { deadline_ms, .. } => *deadline_ms != 0 && crate::time!(ms) >= *deadline_ms,
            Self::OnPage { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskStatus {
    Ready,
    Running,
    Blocked(BlockReason),
    /// killed; cleanup happens at the owning CPU's next preemption point
    Dying,
    Dead,
    Idle,
}

impl TaskStatus {
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// A kernel-mode stack of physically contiguous frames
#[derive(Debug)]
pub struct KernelStack {
    base: Frame,
    pages: usize,
}

pub const KERNEL_STACK_PAGES: usize = 8;

impl KernelStack {
    fn allocate() -> Option<Self> {
        let base = frame_allocator::allocate_contiguous(AllocPolicy::AnyPages, KERNEL_STACK_PAGES, 1)?;
        Some(Self {
            base,
            pages: KERNEL_STACK_PAGES,
        })
    }

    pub fn top(&self) -> VirtAddr {
        self.base.virt_addr() + self.pages * PAGE_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        frame_allocator::deallocate_contiguous(self.base, self.pages);
    }
}

#[derive(Debug)]
pub struct Task {
    id: Tid,
    name: Name,
    status: SpinLock<TaskStatus>,
    /// saved register state; only touched by the owning CPU's scheduler or
    /// before the task ever ran
    context: SyncUnsafeCell<CpuStatus>,
    address_space: Arc<AddressSpace>,
    /// kernel tasks run on this; user tasks bring their own user stack and
    /// trap onto the per-CPU stacks
    kernel_stack: Option<KernelStack>,
    priority: SpinLock<TaskPriority>,
    /// the CPU whose ready queues this task lives in
    assigned_cpu: AtomicU32,
    is_dead: AtomicBool,
    owned_ports: SpinLock<Vec<u64>>,
    owned_handlers: SpinLock<Vec<u32>>,
    groups: SpinLock<Vec<Arc<TaskGroup>>>,
    /// every task gets a rights namespace of its own; explicit groups come
    /// on top
    private_group: Arc<TaskGroup>,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref TASKS: RwLock<HashMap<Tid, Weak<Task>>> = RwLock::new(HashMap::new());
}

pub fn lookup(id: Tid) -> Option<Arc<Task>> {
    TASKS.read().get(&id).and_then(Weak::upgrade)
}

impl Task {
    /// A kernel-mode task entering `entry(arg)` on a fresh kernel stack
    pub fn create_kernel(
        name: Name,
        entry: fn() -> !,
        priority: TaskPriority,
    ) -> Result<Arc<Self>, ErrorStatus> {
        let stack = KernelStack::allocate().ok_or(ErrorStatus::OutOfMemory)?;
        let context = CpuStatus::create(
            VirtAddr::from(entry as usize),
            stack.top(),
            0,
            false,
        );

        Ok(Self::finish_create(
            name,
            context,
            crate::memory::address_space::kernel_space(),
            Some(stack),
            priority,
        ))
    }

    /// A user-mode task entering `entry(arg)` on a caller-provided user
    /// stack inside `space`
    pub fn create_user(
        name: Name,
        space: Arc<AddressSpace>,
        entry: VirtAddr,
        user_stack_top: VirtAddr,
        arg: usize,
        priority: TaskPriority,
    ) -> Result<Arc<Self>, ErrorStatus> {
        let context = CpuStatus::create(entry, user_stack_top, arg, true);
        Ok(Self::finish_create(name, context, space, None, priority))
    }

    fn finish_create(
        name: Name,
        context: CpuStatus,
        address_space: Arc<AddressSpace>,
        kernel_stack: Option<KernelStack>,
        priority: TaskPriority,
    ) -> Arc<Self> {
        let private_group = TaskGroup::create();

        let task = Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            status: SpinLock::new(TaskStatus::Ready),
            context: SyncUnsafeCell::new(context),
            address_space,
            kernel_stack,
            priority: SpinLock::new(priority),
            assigned_cpu: AtomicU32::new(0),
            is_dead: AtomicBool::new(false),
            owned_ports: SpinLock::new(Vec::new()),
            owned_handlers: SpinLock::new(Vec::new()),
            groups: SpinLock::new(Vec::new()),
            private_group: private_group.clone(),
        });

        TASKS.write().insert(task.id, Arc::downgrade(&task));
        let _ = private_group.add_task(&task);
        task
    }

    /// the task's own rights namespace
    pub fn private_group(&self) -> Arc<TaskGroup> {
        self.private_group.clone()
    }

    /// "port zero": the task's default inbox (its first created port)
    pub fn port_zero(&self) -> Option<u64> {
        self.owned_ports.lock().first().copied()
    }

    pub const fn id(&self) -> Tid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.address_space.clone()
    }

    pub fn kernel_stack_top(&self) -> Option<VirtAddr> {
        self.kernel_stack.as_ref().map(KernelStack::top)
    }

    pub fn priority(&self) -> TaskPriority {
        *self.priority.lock()
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        *self.priority.lock() = priority;
    }

    pub fn assigned_cpu(&self) -> usize {
        self.assigned_cpu.load(Ordering::Acquire) as usize
    }

    pub fn set_assigned_cpu(&self, cpu: usize) {
        self.assigned_cpu.store(cpu as u32, Ordering::Release);
    }

    pub fn is_dead(&self) -> bool {
        self.is_dead.load(Ordering::Acquire)
    }

    pub fn status_lock(&self) -> SpinLockGuard<'_, TaskStatus> {
        self.status.lock()
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }

    /// # Safety
    /// only the owning CPU's scheduler may touch a live task's context
    pub unsafe fn context_mut(&self) -> &mut CpuStatus {
        unsafe { &mut *self.context.get() }
    }

    pub fn register_owned_port(&self, port_id: u64) {
        self.owned_ports.lock().push(port_id);
    }

    pub fn unregister_owned_port(&self, port_id: u64) {
        self.owned_ports.lock().retain(|id| *id != port_id);
    }

    pub fn register_handler(&self, gsi: u32) {
        self.owned_handlers.lock().push(gsi);
    }

    pub fn unregister_handler(&self, gsi: u32) {
        self.owned_handlers.lock().retain(|owned| *owned != gsi);
    }

    pub(crate) fn register_group(&self, group: Arc<TaskGroup>) {
        self.groups.lock().push(group);
    }

    pub(crate) fn unregister_group(&self, group: &Arc<TaskGroup>) {
        self.groups
            .lock()
            .retain(|member| !Arc::ptr_eq(member, group));
    }

    pub fn groups(&self) -> Vec<Arc<TaskGroup>> {
        self.groups.lock().clone()
    }

    /// Marks the task dying and detaches it from every wait list. Callable
    /// from any CPU; the body of the cleanup ([`Self::finalize`]) runs when
    /// the owning CPU's scheduler reaps the task at its next preemption
    /// point.
    pub fn atomic_kill(self: &Arc<Self>) {
        // flip to Dying first; waiter-list cleanup happens outside the
        // status lock (the wake paths take port/object locks before it)
        let previous = {
            let mut status = self.status.lock();
            match &*status {
                TaskStatus::Dying | TaskStatus::Dead => return,
                other => {
                    let previous = other.clone();
                    *status = TaskStatus::Dying;
                    previous
                }
            }
        };

        match &previous {
            TaskStatus::Blocked(BlockReason::OnPort { port, .. }) => {
                if let Some(port) = crate::ipc::port::lookup(*port) {
                    port.remove_waiter(self);
                }
            }
            TaskStatus::Blocked(BlockReason::OnPage { .. }) => {
                remove_page_waiters(self);
            }
            _ => {}
        }

        if previous.is_blocked() {
            // nothing queued holds it; reap straight away
            crate::scheduler::reap_now(self);
        } else if previous.is_running() && self.assigned_cpu() != crate::arch::cpu_index() {
            crate::arch::ipi::send_reschedule(self.assigned_cpu());
        }
        // a Ready task is reaped when its queue position comes up
    }

    /// Releases everything the task owned. Runs exactly once, from the
    /// scheduler, after the task can no longer run.
    pub(crate) fn finalize(self: &Arc<Self>) {
        if self.is_dead.swap(true, Ordering::AcqRel) {
            return;
        }

        let ports: Vec<u64> = core::mem::take(&mut *self.owned_ports.lock());
        for port_id in ports {
            if let Some(port) = crate::ipc::port::lookup(port_id) {
                port.destroy();
            }
        }

        let handlers: Vec<u32> = core::mem::take(&mut *self.owned_handlers.lock());
        for gsi in handlers {
            crate::interrupts::remove_handler_for_dead_task(gsi, self.assigned_cpu());
        }

        let groups: Vec<Arc<TaskGroup>> = core::mem::take(&mut *self.groups.lock());
        for group in groups {
            group.remove_dead_task(self.id);
        }

        TASKS.write().remove(&self.id);
        self.set_status(TaskStatus::Dead);
        // the address-space reference drops with the last Arc
    }
}

/// drops the task from any memory-object page wait list it sits on
fn remove_page_waiters(task: &Arc<Task>) {
    MemObject::remove_waiter_everywhere(task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn priorities_map_to_queues_and_quanta() {
        assert!(TaskPriority::High.queue_index() < TaskPriority::Background.queue_index());
        assert_eq!(TaskPriority::High.quantum_ticks() * 10, 20);
        assert_eq!(TaskPriority::Normal.quantum_ticks() * 10, 40);
        assert_eq!(TaskPriority::Low.quantum_ticks() * 10, 80);
        assert_eq!(TaskPriority::Background.quantum_ticks(), u32::MAX);
    }

    #[test_case]
    fn registry_and_kill() {
        fn never_runs() -> ! {
            unreachable!()
        }

        let task = Task::create_kernel(
            Name::try_from("reaper-test").unwrap(),
            never_runs,
            TaskPriority::Low,
        )
        .unwrap();
        let id = task.id();
        assert!(lookup(id).is_some());

        // never scheduled: the kill reaps it immediately via the Ready path
        task.set_status(TaskStatus::Blocked(BlockReason::Sleeping { until_ms: u64::MAX }));
        task.atomic_kill();
        assert!(task.is_dead());
        assert!(lookup(id).is_none());
    }
}
