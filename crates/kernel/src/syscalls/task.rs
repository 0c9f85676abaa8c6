//! SysT / SysGroup syscalls implementation

use macros::syscall_handler;
use portal_abi::{errors::ErrorStatus, task::RawTaskPriority};

use crate::{
    VirtAddr,
    syscalls::ffi::{SyscallArgs, SyscallFFI},
    task::{self, Task, TaskPriority},
    utils::types::Name,
};

#[syscall_handler]
fn syst_spawn(
    entry: VirtAddr,
    user_stack_top: VirtAddr,
    arg: usize,
    out_tid: &mut u64,
) -> Result<(), ErrorStatus> {
    let current = crate::scheduler::current_task();
    // threads inherit the spawner's name; there is no separate thread name
    let name = Name::try_from(current.name()).map_err(|_| ErrorStatus::NameTooLong)?;

    let spawned = Task::create_user(
        name,
        current.address_space(),
        entry,
        user_stack_top,
        arg,
        current.priority(),
    )?;

    crate::scheduler::add_task(&spawned, None);
    *out_tid = spawned.id();
    Ok(())
}

#[syscall_handler]
fn syst_kill(tid: u64) -> Result<(), ErrorStatus> {
    let target = task::lookup(tid).ok_or(ErrorStatus::NotFound)?;
    target.atomic_kill();
    Ok(())
}

#[syscall_handler]
fn syst_set_priority(tid: u64, raw: u32) -> Result<(), ErrorStatus> {
    let target = task::lookup(tid).ok_or(ErrorStatus::NotFound)?;
    let raw = RawTaskPriority::try_from(raw).map_err(|_| ErrorStatus::InvalidArgument)?;

    // the new slice length applies from the task's next dispatch
    target.set_priority(TaskPriority::from(raw));
    Ok(())
}

#[syscall_handler]
fn syst_set_affinity(tid: u64, cpu: usize) -> Result<(), ErrorStatus> {
    if cpu >= crate::arch::cpu_count() {
        return Err(ErrorStatus::InvalidArgument);
    }

    let target = task::lookup(tid).ok_or(ErrorStatus::NotFound)?;
    // takes effect at the next wake/requeue on the new CPU
    target.set_assigned_cpu(cpu);
    Ok(())
}

#[syscall_handler]
fn sysgroup_create(out_id: &mut u64) -> Result<(), ErrorStatus> {
    let group = task::group::TaskGroup::create();
    *out_id = group.id();
    Ok(())
}

#[syscall_handler]
fn sysgroup_add_task(group_id: u64, tid: u64) -> Result<(), ErrorStatus> {
    let group = task::group::lookup(group_id).ok_or(ErrorStatus::NotFound)?;
    let target = task::lookup(tid).ok_or(ErrorStatus::NotFound)?;
    group.add_task(&target)
}

#[syscall_handler]
fn sysgroup_remove_task(group_id: u64, tid: u64) -> Result<(), ErrorStatus> {
    let group = task::group::lookup(group_id).ok_or(ErrorStatus::NotFound)?;
    let target = task::lookup(tid).ok_or(ErrorStatus::NotFound)?;
    group.remove_task(&target)
}

#[syscall_handler]
fn sysgroup_set_notifier(group_id: u64, port_id: u64, mask: u32) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let group = task::group::lookup(group_id).ok_or(ErrorStatus::NotFound)?;
    let port = super::ipc::resolve_port(&task, port_id)?;
    group.set_notifier(&port, mask)
}
