//! The per-CPU scheduler.
//!
//! Four ready queues per CPU (one per priority), fixed time slices, one idle
//! task each. The kernel is non-preemptible within a CPU: switches happen
//! only inside the trap path, by rewriting the interrupt context the stubs
//! restore. Cross-CPU wakes go through reschedule IPIs.

use core::cell::SyncUnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
    vec::Vec,
};
use portal_abi::errors::ErrorStatus;

use crate::{
    VirtAddr, arch,
    arch::TrapContext,
    ipc::Port,
    memory::{address_space::AddressSpace, mem_object::MemObject},
    task::{BlockReason, Task, TaskPriority, TaskStatus},
    utils::{locks::SpinLock, types::Name},
};

const QUEUE_COUNT: usize = 4;

#[derive(Debug)]
pub struct Scheduler {
    cpu: usize,
    current: SyncUnsafeCell<Option<Arc<Task>>>,
    idle: SyncUnsafeCell<Option<Arc<Task>>>,
    /// which address space this CPU has live
    active_space: SyncUnsafeCell<Option<Arc<AddressSpace>>>,
    queues: SpinLock<[VecDeque<Arc<Task>>; QUEUE_COUNT]>,
    /// deadline wakes: `(deadline_ms, task)`
    sleepers: SpinLock<Vec<(u64, Weak<Task>)>>,
    /// `TimerReply` deliveries armed by `SysTSleep` with a port
    timer_replies: SpinLock<Vec<(u64, Weak<Port>)>>,
    timeslice_left: SyncUnsafeCell<u32>,
    reschedule_pending: AtomicBool,
    /// queue index of the running task, for cross-CPU wake decisions
    current_queue_index: AtomicU32,
    task_count: AtomicUsize,
}

unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

pub static SCHEDULER_INITED: AtomicBool = AtomicBool::new(false);

impl Scheduler {
    pub fn new(cpu: usize) -> Self {
        Self {
            cpu,
            current: SyncUnsafeCell::new(None),
            idle: SyncUnsafeCell::new(None),
            active_space: SyncUnsafeCell::new(None),
            queues: SpinLock::new([const { VecDeque::new() }; QUEUE_COUNT]),
            sleepers: SpinLock::new(Vec::new()),
            timer_replies: SpinLock::new(Vec::new()),
            timeslice_left: SyncUnsafeCell::new(0),
            reschedule_pending: AtomicBool::new(false),
            current_queue_index: AtomicU32::new(QUEUE_COUNT as u32),
            task_count: AtomicUsize::new(0),
        }
    }

    /// the executing CPU's scheduler
    pub fn get() -> &'static Self {
        &arch::threading::cpu_local().scheduler
    }

    pub fn get_all() -> impl Iterator<Item = &'static Self> {
        arch::threading::cpu_locals()
            .iter()
            .map(|storage| &storage.scheduler)
    }

    /// Get the current task
    /// safe because the slot is only written by this CPU's switch path
    pub fn current(&self) -> Option<Arc<Task>> {
        unsafe { (*self.current.get()).clone() }
    }

    fn idle_task(&self) -> Arc<Task> {
        unsafe { (*self.idle.get()).clone().expect("no idle task") }
    }

    pub fn queued_tasks(&self) -> usize {
        self.task_count.load(Ordering::Acquire)
    }

    fn enqueue_ready(&self, task: Arc<Task>) {
        let index = task.priority().queue_index();
        self.queues.lock()[index].push_back(task);
        self.task_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Highest-priority ready task, reaping dying ones on the way
    fn pop_ready(&self) -> Option<Arc<Task>> {
        loop {
            let task = {
                let mut queues = self.queues.lock();
                let mut found = None;
                for queue in queues.iter_mut() {
                    if let Some(task) = queue.pop_front() {
                        found = Some(task);
                        break;
                    }
                }
                found?
            };
            self.task_count.fetch_sub(1, Ordering::AcqRel);

            let status = task.status_lock().clone();
            match status {
                TaskStatus::Ready => return Some(task),
                TaskStatus::Dying => task.finalize(),
                // woken elsewhere or racing; never hand out
                _ => {}
            }
        }
    }

    fn wake_sleepers(&self) {
        let now = crate::time!(ms);
        let due: Vec<Weak<Task>> = {
            let mut sleepers = self.sleepers.lock();
            let mut due = Vec::new();
            sleepers.retain(|(deadline, task)| {
                if *deadline <= now {
                    due.push(task.clone());
                    false
                } else {
                    true
                }
            });
            due
        };

        for task in due {
            if let Some(task) = task.upgrade() {
                unblock(&task);
            }
        }

        let due_replies: Vec<(u64, Weak<Port>)> = {
            let mut replies = self.timer_replies.lock();
            let mut due = Vec::new();
            replies.retain(|(deadline, port)| {
                if *deadline <= now {
                    due.push((*deadline, port.clone()));
                    false
                } else {
                    true
                }
            });
            due
        };

        for (deadline, port) in due_replies {
            if let Some(port) = port.upgrade() {
                let payload = portal_abi::ipc::TimerReply {
                    header: portal_abi::ipc::MessageHeader {
                        msg_type: portal_abi::ipc::MSG_TYPE_TIMER_REPLY,
                        flags: 0,
                    },
                    deadline_ms: deadline,
                }
                .as_bytes()
                .to_vec();
                let _ = port.send_from_system(payload);
            }
        }
    }

    fn add_sleeper(&self, deadline_ms: u64, task: &Arc<Task>) {
        self.sleepers.lock().push((deadline_ms, Arc::downgrade(task)));
    }

    /// Saves the interrupted context into the current task and dispatches
    /// the best ready one into `ctx`. Interrupts are off (trap path).
    fn preempt(&self, ctx: &mut TrapContext) {
        let Some(current) = self.current() else {
            return;
        };

        unsafe {
            ctx.save_into(current.context_mut());
        }

        let mut requeue = false;
        let mut reap = false;
        {
            let mut status = current.status_lock();
            match status.clone() {
                TaskStatus::Running => {
                    *status = TaskStatus::Ready;
                    requeue = true;
                }
                // blocked tasks wait off-queue, idle never queues
                TaskStatus::Blocked(_) | TaskStatus::Idle => {}
                TaskStatus::Dying => reap = true,
                TaskStatus::Ready | TaskStatus::Dead => {}
            }
        }
        if requeue {
            self.enqueue_ready(current);
        } else if reap {
            current.finalize();
        }

        self.dispatch_next(ctx);
    }

    fn dispatch_next(&self, ctx: &mut TrapContext) {
        let next = match self.pop_ready() {
            Some(task) => task,
            None => self.idle_task(),
        };

        let space = next.address_space();
        let switch_space = unsafe {
            !(*self.active_space.get())
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &space))
        };
        if switch_space {
            unsafe {
                // the new root goes live before the old space loses its last
                // reference; dropping it frees its tables
                space.activate_on(self.cpu);
                if let Some(previous) = (*self.active_space.get()).take() {
                    previous.deactivate_on(self.cpu);
                }
                *self.active_space.get() = Some(space);
            }
        }

        {
            let mut status = next.status_lock();
            if !matches!(&*status, TaskStatus::Idle) {
                *status = TaskStatus::Running;
            }
        }

        let priority = next.priority();
        unsafe {
            *self.timeslice_left.get() = priority.quantum_ticks();
            ctx.load_from(next.context_mut());
            *self.current.get() = Some(next);
        }
        self.current_queue_index
            .store(priority.queue_index() as u32, Ordering::Release);
    }
}

/// Returns the task executing on this CPU
pub fn current_task() -> Arc<Task> {
    Scheduler::get()
        .current()
        .expect("no current task on this CPU")
}

/// Adds a task to a CPU's ready queues: the given one, or the least loaded
pub fn add_task(task: &Arc<Task>, cpu: Option<usize>) {
    let (cpu_index, scheduler) = match cpu {
        Some(cpu) if cpu < arch::cpu_count() => {
            (cpu, &arch::threading::cpu_locals()[cpu].scheduler)
        }
        _ => Scheduler::get_all()
            .enumerate()
            .min_by_key(|(_, scheduler)| scheduler.queued_tasks())
            .expect("no CPU found"),
    };

    task.set_assigned_cpu(cpu_index);
    task.set_status(TaskStatus::Ready);
    scheduler.enqueue_ready(task.clone());

    crate::debug!(
        Scheduler,
        "task {} ({}) added, CPU: {cpu_index}",
        task.id(),
        task.name()
    );

    maybe_kick(cpu_index, task.priority());
}

/// Wakes a blocked task, requeueing it on its CPU and kicking that CPU if
/// it runs something weaker
pub fn unblock(task: &Arc<Task>) {
    let reason = {
        let mut status = task.status_lock();
        match &*status {
            TaskStatus::Blocked(reason) => {
                let reason = reason.clone();
                *status = TaskStatus::Ready;
                reason
            }
            _ => return,
        }
    };

    // a deadline wake leaves the waiter entry behind; purge it so a later
    // enqueue cannot spuriously wake whatever this task blocks on next
    if let BlockReason::OnPort { port, .. } = reason
        && let Some(port) = crate::ipc::port::lookup(port)
    {
        port.remove_waiter(task);
    }

    let cpu = task.assigned_cpu();
    let scheduler = &arch::threading::cpu_locals()[cpu].scheduler;
    scheduler.enqueue_ready(task.clone());
    maybe_kick(cpu, task.priority());
}

fn maybe_kick(cpu: usize, priority: TaskPriority) {
    let scheduler = &arch::threading::cpu_locals()[cpu].scheduler;

    if cpu == arch::cpu_index() {
        scheduler.reschedule_pending.store(true, Ordering::Release);
        return;
    }

    let running = scheduler.current_queue_index.load(Ordering::Acquire);
    if (priority.queue_index() as u32) < running {
        scheduler.reschedule_pending.store(true, Ordering::Release);
        arch::ipi::send_reschedule(cpu);
    }
}

/// The timer interrupt: clock keeping, deadline wakes, quantum accounting
pub fn timer_tick(ctx: &mut TrapContext) {
    if arch::cpu_index() == 0 {
        arch::utils::tick();
    }

    if !SCHEDULER_INITED.load(Ordering::Acquire) {
        return;
    }
    let scheduler = Scheduler::get();
    let Some(current) = scheduler.current() else {
        return;
    };

    scheduler.wake_sleepers();

    let expired = unsafe {
        let slice = &mut *scheduler.timeslice_left.get();
        if *slice != u32::MAX && *slice > 0 {
            *slice -= 1;
        }
        *slice == 0
    };

    let pending = scheduler.reschedule_pending.swap(false, Ordering::AcqRel);
    let status = current.status_lock().clone();
    let must_switch = matches!(status, TaskStatus::Dying | TaskStatus::Idle);

    if expired || pending || must_switch {
        scheduler.preempt(ctx);
    }
}

/// A reschedule IPI (or a voluntary yield) landed
pub fn reschedule_from_ipi(ctx: &mut TrapContext) {
    if !SCHEDULER_INITED.load(Ordering::Acquire) {
        return;
    }
    let scheduler = Scheduler::get();
    scheduler.reschedule_pending.store(false, Ordering::Release);
    scheduler.preempt(ctx);
}

/// Cooperative yield from kernel code (lock spins, idle paths)
pub fn yield_now() {
    if !SCHEDULER_INITED.load(Ordering::Acquire)
        || !arch::threading::cpu_locals_ready()
        || !arch::interrupts_enabled()
    {
        core::hint::spin_loop();
        return;
    }
    arch::trigger_reschedule();
}

/// Switches away from a task something else already marked blocked (the
/// port's `receive_or_park`); a non-zero `deadline_ms` also arms the wake
pub fn finish_blocking(ctx: &mut TrapContext, deadline_ms: u64) {
    let scheduler = Scheduler::get();
    if deadline_ms != 0 {
        scheduler.add_sleeper(deadline_ms, &current_task());
    }
    scheduler.preempt(ctx);
}

/// Parks the current task until a backing object materializes `va`'s page
pub fn block_current_on_page(
    ctx: &mut TrapContext,
    object: Arc<MemObject>,
    index: usize,
    va: VirtAddr,
) {
    let current = current_task();

    // blocked before parked: a pager supplying the page right after the
    // park must find a wakeable task
    current.set_status(TaskStatus::Blocked(BlockReason::OnPage { va }));
    object.park_waiter(index, current.clone());

    // the supply may have slipped in between the fault and the park; if the
    // page is there now, just resume (a stale ready-queue entry from a
    // racing wake is skipped by `pop_ready`)
    if object.page_at(index).is_some() {
        current.set_status(TaskStatus::Running);
        MemObject::remove_waiter_everywhere(&current);
        return;
    }

    Scheduler::get().preempt(ctx);
}

pub fn sleep_current(ctx: &mut TrapContext, until_ms: u64) {
    let scheduler = Scheduler::get();
    let current = current_task();
    current.set_status(TaskStatus::Blocked(BlockReason::Sleeping { until_ms }));
    scheduler.add_sleeper(until_ms, &current);
    scheduler.preempt(ctx);
}

/// Arms a `TimerReply` delivery to `port` at `deadline_ms` of uptime
pub fn register_timer_reply(deadline_ms: u64, port: &Arc<Port>) {
    Scheduler::get()
        .timer_replies
        .lock()
        .push((deadline_ms, Arc::downgrade(port)));
}

/// Kills the executing task and dispatches away from it
pub fn kill_current(ctx: &mut TrapContext, reason: ErrorStatus) {
    let current = current_task();
    crate::debug!(
        Scheduler,
        "killing task {} ({}): {reason:?}",
        current.id(),
        current.name()
    );
    current.atomic_kill();
    Scheduler::get().preempt(ctx);
}

/// Finalizes a task that can no longer run (killed while blocked); safe to
/// call from any CPU because the task sits in no queue
pub fn reap_now(task: &Arc<Task>) {
    task.finalize();
}

fn idle_task_loop() -> ! {
    loop {
        unsafe {
            arch::enable_interrupts();
            arch::hlt();
        }
    }
}

fn make_idle_task(cpu: usize) -> Arc<Task> {
    let idle = Task::create_kernel(
        Name::try_from("idle").unwrap(),
        idle_task_loop,
        TaskPriority::Background,
    )
    .expect("out of memory creating an idle task");
    idle.set_assigned_cpu(cpu);
    idle.set_status(TaskStatus::Idle);
    idle
}

/// Boots the scheduler: an idle task per CPU, the root kernel task on the
/// boot CPU, then jumps into it
pub unsafe fn init(main: fn() -> !, name: &str) -> ! {
    unsafe {
        arch::disable_interrupts();
    }

    for storage in arch::threading::cpu_locals() {
        let idle = make_idle_task(storage.cpu_index);
        unsafe {
            *storage.scheduler.idle.get() = Some(idle);
        }
    }

    let main_task = Task::create_kernel(
        Name::try_from(name).expect("root task name too long"),
        main,
        TaskPriority::Normal,
    )
    .expect("out of memory creating the root task");
    main_task.set_assigned_cpu(0);
    main_task.set_status(TaskStatus::Running);

    let scheduler = Scheduler::get();
    let space = main_task.address_space();
    space.activate_on(0);
    unsafe {
        *scheduler.active_space.get() = Some(space);
        *scheduler.timeslice_left.get() = main_task.priority().quantum_ticks();
        *scheduler.current.get() = Some(main_task.clone());
    }
    scheduler
        .current_queue_index
        .store(main_task.priority().queue_index() as u32, Ordering::Release);

    SCHEDULER_INITED.store(true, Ordering::Release);
    crate::debug!(
        Scheduler,
        "INITED, jumping to {:#x} with stack {:#x}",
        unsafe { main_task.context_mut().at() },
        unsafe { main_task.context_mut().stack_at() }
    );

    unsafe { arch::threading::restore_cpu_status(main_task.context_mut()) }
}

/// A secondary CPU parks itself here until work shows up
pub fn enter_idle() -> ! {
    while !SCHEDULER_INITED.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    let scheduler = Scheduler::get();
    let idle = scheduler.idle_task();
    let space = idle.address_space();
    space.activate_on(scheduler.cpu);
    unsafe {
        *scheduler.active_space.get() = Some(space);
        *scheduler.timeslice_left.get() = 1;
        *scheduler.current.get() = Some(idle.clone());
        arch::threading::restore_cpu_status(idle.context_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn ready_accounting_matches_queues() {
        fn never_runs() -> ! {
            unreachable!()
        }

        let scheduler = Scheduler::get();
        let before = scheduler.queued_tasks();

        let task = Task::create_kernel(
            Name::try_from("queue-test").unwrap(),
            never_runs,
            TaskPriority::Low,
        )
        .unwrap();
        add_task(&task, Some(arch::cpu_index()));
        assert_eq!(scheduler.queued_tasks(), before + 1);

        // killing a queued task reaps it on the next pop
        task.atomic_kill();
        let mut kept = alloc::vec::Vec::new();
        while let Some(other) = scheduler.pop_ready() {
            kept.push(other);
        }
        assert!(task.is_dead());
        assert_eq!(scheduler.queued_tasks(), 0);

        // put whatever else was ready back
        for other in kept {
            scheduler.enqueue_ready(other);
        }
        assert_eq!(scheduler.queued_tasks(), before);
    }

    #[test_case]
    fn unblock_requeues_once() {
        fn never_runs() -> ! {
            unreachable!()
        }

        let task = Task::create_kernel(
            Name::try_from("wake-test").unwrap(),
            never_runs,
            TaskPriority::Normal,
        )
        .unwrap();
        task.set_assigned_cpu(arch::cpu_index());
        task.set_status(TaskStatus::Blocked(BlockReason::OnPort {
            port: 0,
            deadline_ms: 0,
        }));

        let scheduler = Scheduler::get();
        let before = scheduler.queued_tasks();

        unblock(&task);
        // a second wake finds it Ready and does nothing
        unblock(&task);
        assert_eq!(scheduler.queued_tasks(), before + 1);

        task.atomic_kill();
        let mut kept = alloc::vec::Vec::new();
        while let Some(other) = scheduler.pop_ready() {
            kept.push(other);
        }
        for other in kept {
            scheduler.enqueue_ready(other);
        }
        assert_eq!(scheduler.queued_tasks(), before);
    }
}
