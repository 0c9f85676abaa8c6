//! The syscall dispatcher: the narrow entry between user space and
//! everything else. Argument conversion goes through [`ffi::SyscallFFI`],
//! fed from the raw register stream; handlers that can park the caller live
//! here because they need the trap context to do it.

use portal_abi::errors::{ErrorStatus, SysResult};
use portal_abi::ipc::RawMessageInfo;
use portal_abi::syscalls::SyscallTable;

use crate::arch::TrapContext;
use crate::scheduler;
use crate::syscalls::ffi::{SyscallArgs, SyscallFFI};

pub mod ffi;
mod interrupt;
/// SysMsg / SysPort / SysRight syscalls implementation
mod ipc;
/// SysMem syscalls implementation
mod mem;
/// SysT / SysGroup syscalls implementation
mod task;

/// The architecture trap paths land here with the raw context. A `None`
/// from the dispatch means the caller was parked (or killed) and the
/// context already belongs to someone else.
pub fn entry(ctx: &mut TrapContext) {
    let (number, slots) = ctx.syscall_args();
    if let Some(result) = syscall(ctx, number, SyscallArgs::new(slots)) {
        ctx.set_syscall_ret(result.into_raw());
    }
}

#[inline(always)]
/// takes the number of the syscall and its register stream and returns an
/// error as a negative value if it fails
/// this function is the final non-arch-specific layer between the kernel and the syscalls
/// argument shapes are decided per handler by the [`SyscallFFI`] impls
fn syscall(ctx: &mut TrapContext, number: u16, args: SyscallArgs) -> Option<SysResult> {
    // the two calls that return a payload or park with a restart go first;
    // everything else funnels through the uniform table below
    match SyscallTable::try_from(number) {
        Ok(SyscallTable::SysMsgReceive) => return sysmsg_receive(ctx, args),
        Ok(SyscallTable::SysTSleep) => return syst_sleep(ctx, args).map(Into::into),
        _ => {}
    }

    #[inline(always)]
    fn inner(
        ctx: &mut TrapContext,
        number: u16,
        args: SyscallArgs,
    ) -> Option<Result<(), ErrorStatus>> {
        let Ok(syscall) = SyscallTable::try_from(number) else {
            return Some(Err(ErrorStatus::InvalidSyscall));
        };

        Some(match syscall {
            // tasks
            SyscallTable::SysTExit => {
                scheduler::kill_current(ctx, ErrorStatus::Generic);
                return None;
            }
            SyscallTable::SysTYield => {
                ctx.set_syscall_ret(0);
                scheduler::reschedule_from_ipi(ctx);
                return None;
            }
            // handled before the table
            SyscallTable::SysTSleep | SyscallTable::SysMsgReceive => unreachable!(),
            SyscallTable::SysTSpawn => task::syst_spawn_raw(args),
            SyscallTable::SysTKill => task::syst_kill_raw(args),
            SyscallTable::SysTSetPriority => task::syst_set_priority_raw(args),
            SyscallTable::SysTSetAffinity => task::syst_set_affinity_raw(args),

            // ports, messages, rights
            SyscallTable::SysPortCreate => ipc::sysport_create_raw(args),
            SyscallTable::SysMsgSendPort => ipc::sysmsg_send_port_raw(args),
            SyscallTable::SysMsgSendRight => ipc::sysmsg_send_right_raw(args),
            SyscallTable::SysRightCreate => ipc::sysright_create_raw(args),
            SyscallTable::SysRightDuplicate => ipc::sysright_duplicate_raw(args),
            SyscallTable::SysRightDrop => ipc::sysright_drop_raw(args),
            SyscallTable::SysPortNameBind => ipc::sysport_name_bind_raw(args),
            SyscallTable::SysPortNameRequest => ipc::sysport_name_request_raw(args),

            // memory
            SyscallTable::SysMemRegionAnon => mem::sysmem_region_anon_raw(args),
            SyscallTable::SysMemRegionPhys => mem::sysmem_region_phys_raw(args),
            SyscallTable::SysMemRegionObject => mem::sysmem_region_object_raw(args),
            SyscallTable::SysMemRegionUnmap => mem::sysmem_region_unmap_raw(args),
            SyscallTable::SysMemObjectCreate => mem::sysmem_object_create_raw(args),

            // groups
            SyscallTable::SysGroupCreate => task::sysgroup_create_raw(args),
            SyscallTable::SysGroupAddTask => task::sysgroup_add_task_raw(args),
            SyscallTable::SysGroupRemoveTask => task::sysgroup_remove_task_raw(args),
            SyscallTable::SysGroupSetNotifier => task::sysgroup_set_notifier_raw(args),

            // interrupts
            SyscallTable::SysIntSetHandler => interrupt::sysint_set_handler_raw(args),
            SyscallTable::SysIntComplete => interrupt::sysint_complete_raw(args),

            SyscallTable::SysUptime => (|| {
                let mut args = args;
                let dest_uptime = <&mut u64>::make(&mut args)?;
                *dest_uptime = crate::time!(ms);
                Ok(())
            })(),
        })
    }

    inner(ctx, number, args).map(|result| result.into())
}

/// Blocks until `until_ms` of uptime; a non-zero `reply_port` additionally
/// gets a `TimerReply` when the deadline fires (and the call returns
/// immediately)
fn syst_sleep(ctx: &mut TrapContext, mut args: SyscallArgs) -> Option<Result<(), ErrorStatus>> {
    let ms = args.take() as u64;
    let reply_port = args.take() as u64;
    let until_ms = crate::time!(ms).saturating_add(ms);

    if reply_port != 0 {
        let task = scheduler::current_task();
        let port = match ipc::resolve_port(&task, reply_port) {
            Ok(port) => port,
            Err(err) => return Some(Err(err)),
        };
        scheduler::register_timer_reply(until_ms, &port);
        return Some(Ok(()));
    }

    ctx.set_syscall_ret(0);
    scheduler::sleep_current(ctx, until_ms);
    None
}

/// Dequeues from a port; a deadline of 0 polls, `u64::MAX` blocks forever,
/// anything else is an absolute uptime deadline
fn sysmsg_receive(ctx: &mut TrapContext, mut args: SyscallArgs) -> Option<SysResult> {
    let setup = (|| {
        let task = scheduler::current_task();
        let port_id = args.take() as u64;
        let port = ipc::resolve_port(&task, port_id)?;
        if port.owner_id() != task.id() {
            return Err(ErrorStatus::WrongOwner);
        }

        let buffer: &mut [u8] = SyscallFFI::make(&mut args)?;
        let deadline_ms = args.take() as u64;
        let info: &mut RawMessageInfo = SyscallFFI::make(&mut args)?;
        Ok((task, port, buffer, deadline_ms, info))
    })();

    let (task, port, buffer, deadline_ms, info) = match setup {
        Ok(parts) => parts,
        Err(err) => return Some(Err::<usize, _>(err).into()),
    };

    let expired = deadline_ms == 0 || (deadline_ms != u64::MAX && crate::time!(ms) >= deadline_ms);
    let message = if expired {
        // polling (or the wake after the deadline): no parking allowed
        port.pop_message()
    } else {
        let deadline = if deadline_ms == u64::MAX { 0 } else { deadline_ms };
        match port.receive_or_park(&task, deadline) {
            Some(message) => Some(message),
            None => {
                // parked; restart the syscall on wake
                ctx.rewind_syscall();
                scheduler::finish_blocking(ctx, deadline);
                return None;
            }
        }
    };

    Some(match message {
        Some(message) => match ipc::deliver_received(&task, &port, message, buffer, info) {
            Ok(len) => Ok::<usize, ErrorStatus>(len).into(),
            Err(err) => Err::<usize, _>(err).into(),
        },
        None => Err::<usize, _>(ErrorStatus::Timeout).into(),
    })
}
