//! SysPort / SysMsg / SysRight syscalls implementation

use alloc::{sync::Arc, vec::Vec};
use macros::syscall_handler;
use portal_abi::{
    consts::MESSAGE_RIGHTS_MAX,
    errors::ErrorStatus,
    ipc::{RawMessageInfo, RawSendExtra},
};

use crate::{
    ipc::{Port, Right, RightType, named, port, rights},
    syscalls::ffi::{SyscallArgs, SyscallFFI},
    task::{Task, group},
};

/// resolves a port id against the calling task; id 0 is the task's default
/// inbox
pub(super) fn resolve_port(task: &Arc<Task>, id: u64) -> Result<Arc<Port>, ErrorStatus> {
    let id = if id == 0 {
        task.port_zero().ok_or(ErrorStatus::NotFound)?
    } else {
        id
    };
    port::lookup(id).ok_or(ErrorStatus::PortDead)
}

#[syscall_handler]
fn sysport_create(out_id: &mut u64) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let port = Port::atomic_create_port(&task)?;
    *out_id = port.id();
    Ok(())
}

#[syscall_handler]
fn sysright_create(
    port_id: u64,
    group_id: u64,
    raw_type: u32,
    parent_id: u64,
    out_id: &mut u64,
) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let port = resolve_port(&task, port_id)?;

    // only the port's owner mints rights to it
    if port.owner_id() != task.id() {
        return Err(ErrorStatus::WrongOwner);
    }

    let group = if group_id == 0 {
        task.private_group()
    } else {
        group::lookup(group_id).ok_or(ErrorStatus::NotFound)?
    };

    let rtype = match raw_type {
        0 => RightType::SendOnce,
        1 => RightType::SendMany,
        _ => return Err(ErrorStatus::InvalidArgument),
    };

    let (_, sender_id) = Right::create_for_group(&port, &group, rtype, parent_id)?;
    *out_id = sender_id;
    Ok(())
}

#[syscall_handler]
fn sysright_duplicate(right_id: u64, out_id: &mut u64) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let group = task.private_group();
    let right = group.find_right(right_id).ok_or(ErrorStatus::RightDead)?;

    let (_, new_id) = right.duplicate(&group)?;
    *out_id = new_id;
    Ok(())
}

#[syscall_handler]
fn sysright_drop(right_id: u64) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let group = task.private_group();
    let right = group.find_right(right_id).ok_or(ErrorStatus::RightDead)?;
    right.destroy(Some(&group))
}

#[syscall_handler]
fn sysport_name_bind(port_id: u64, name: &str) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let port = resolve_port(&task, port_id)?;
    if port.owner_id() != task.id() {
        return Err(ErrorStatus::WrongOwner);
    }
    named::bind(name, &port)
}

#[syscall_handler]
fn sysport_name_request(name: &str, reply_port_id: u64) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let reply_port = resolve_port(&task, reply_port_id)?;
    named::request(name, &reply_port)
}

/// The bare send: payload to a port by id, no rights. Discovery still goes
/// through names and rights; this is the loopback/bootstrap path.
#[syscall_handler]
fn sysmsg_send_port(port_id: u64, payload: &[u8]) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let port = resolve_port(&task, port_id)?;
    port.send_from_user(task.id(), payload.to_vec())
}

/// Sends `payload` through the right `right_id` of the caller's namespace,
/// optionally carrying rights and requesting a reply right
#[syscall_handler]
fn sysmsg_send_right(
    right_id: u64,
    payload: &[u8],
    extra: Option<&RawSendExtra>,
) -> Result<(), ErrorStatus> {
    let task = crate::scheduler::current_task();
    let group = task.private_group();

    let right = group.find_right(right_id).ok_or(ErrorStatus::RightDead)?;

    let mut carried: Vec<Arc<Right>> = Vec::new();
    let mut reply_port = None;
    if let Some(extra) = extra {
        for &carried_id in extra.carried.iter().filter(|id| **id != 0) {
            carried.push(group.find_right(carried_id).ok_or(ErrorStatus::RightDead)?);
        }
        if extra.reply_port != 0 {
            reply_port = Some(resolve_port(&task, extra.reply_port)?);
        }
    }

    rights::send_message_right(
        &right,
        &group,
        payload.to_vec(),
        &carried,
        reply_port.as_ref(),
        task.id(),
    )
}

/// Unpacks a dequeued message into the caller's buffer, moving its rights
/// into the caller's namespace. The blocking half lives in the dispatcher
/// because it needs the trap context.
pub(super) fn deliver_received(
    task: &Arc<Task>,
    port: &Arc<Port>,
    mut message: crate::ipc::Message,
    buffer: &mut [u8],
    info: &mut RawMessageInfo,
) -> Result<usize, ErrorStatus> {
    if message.payload.len() > buffer.len() {
        // tell the caller how big a buffer it needs and keep the message
        info.payload_len = message.payload.len() as u64;
        port.requeue_front(message);
        return Err(ErrorStatus::InvalidArgument);
    }

    let group = task.private_group();

    *info = RawMessageInfo {
        sender: message.sender,
        payload_len: message.payload.len() as u64,
        sent_under: message.sent_under,
        reply_id: 0,
        right_ids: [0; MESSAGE_RIGHTS_MAX],
    };

    buffer[..message.payload.len()].copy_from_slice(&message.payload);

    if let Some(reply) = message.reply_right.take() {
        info.reply_id = reply.attach_to_group(&group);
    }
    for (slot, out) in message.rights.iter_mut().zip(info.right_ids.iter_mut()) {
        if let Some(right) = slot.take() {
            *out = right.attach_to_group(&group);
        }
    }

    Ok(info.payload_len as usize)
}
