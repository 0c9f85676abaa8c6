//! The interrupt router: user-space handlers for hardware interrupt lines.
//!
//! Each CPU has its own table of installed handlers sorted by GSI (binary
//! search on delivery). A delivery enqueues a `KernelInterruptMessage` on
//! the handler's port and marks it active, which suppresses further edges
//! until user space acknowledges; the controller source is kept quiet in
//! the meantime.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use portal_abi::{
    errors::ErrorStatus,
    ipc::{KernelInterruptMessage, MSG_TYPE_KERNEL_INTERRUPT, MessageHeader},
};
use spin::Once;

use crate::{
    arch::{self, intctl},
    ipc::Port,
    task::Task,
    utils::locks::SpinLock,
};

#[derive(Debug)]
pub struct IntHandler {
    gsi: u32,
    owner: Weak<Task>,
    owner_id: u64,
    port: Weak<Port>,
    /// set between delivery and user acknowledgement; suppresses redelivery
    active: AtomicBool,
}

static HANDLERS: Once<Box<[SpinLock<Vec<Arc<IntHandler>>>]>> = Once::new();

fn tables() -> &'static [SpinLock<Vec<Arc<IntHandler>>>] {
    HANDLERS.call_once(|| {
        let mut tables = Vec::with_capacity(arch::cpu_count());
        for _ in 0..arch::cpu_count() {
            tables.push(SpinLock::new(Vec::new()));
        }
        tables.into_boxed_slice()
    })
}

fn find(table: &[Arc<IntHandler>], gsi: u32) -> Result<usize, usize> {
    table.binary_search_by_key(&gsi, |handler| handler.gsi)
}

/// Installs a user-space handler for `gsi`, delivering to `port`. The
/// owning task must be pinned to the CPU the handler lives on; delivery
/// happens there.
pub fn install(gsi: u32, port: &Arc<Port>, task: &Arc<Task>) -> Result<(), ErrorStatus> {
    if gsi >= intctl::gsi_limit() {
        return Err(ErrorStatus::InvalidArgument);
    }
    if !port.is_alive() {
        return Err(ErrorStatus::PortDead);
    }

    let cpu = task.assigned_cpu();
    let mut table = tables()[cpu].lock();

    if table.len() >= intctl::gsi_limit() as usize {
        return Err(ErrorStatus::OutOfInterruptVectors);
    }
    let Err(position) = find(&table, gsi) else {
        return Err(ErrorStatus::AlreadyExists);
    };

    let handler = Arc::new(IntHandler {
        gsi,
        owner: Arc::downgrade(task),
        owner_id: task.id(),
        port: Arc::downgrade(port),
        active: AtomicBool::new(false),
    });
    table.insert(position, handler);
    drop(table);

    task.register_handler(gsi);
    intctl::unmask_gsi(gsi, cpu);
    Ok(())
}

/// Removes the handler for `gsi` on the caller's CPU, masking the source
pub fn remove(gsi: u32, task: &Arc<Task>) -> Result<(), ErrorStatus> {
    let cpu = task.assigned_cpu();
    let mut table = tables()[cpu].lock();

    let Ok(position) = find(&table, gsi) else {
        return Err(ErrorStatus::NotFound);
    };
    if table[position].owner_id != task.id() {
        return Err(ErrorStatus::WrongOwner);
    }

    table.remove(position);
    drop(table);

    intctl::mask_gsi(gsi);
    task.unregister_handler(gsi);
    Ok(())
}

/// The task-death path: the task's handler list is already drained, only
/// the table entry and the mask remain
pub fn remove_handler_for_dead_task(gsi: u32, cpu: usize) {
    let mut table = tables()[cpu].lock();
    if let Ok(position) = find(&table, gsi) {
        table.remove(position);
        intctl::mask_gsi(gsi);
    }
}

/// Hardware delivery on the executing CPU: look the handler up, enqueue the
/// message, suppress until acknowledged. A dead port tears the handler down.
pub fn deliver(gsi: u32) {
    let cpu = arch::cpu_index();
    let Some(tables) = HANDLERS.get() else {
        return;
    };

    let handler = {
        let table = tables[cpu].lock();
        match find(&table, gsi) {
            Ok(position) => table[position].clone(),
            Err(_) => {
                crate::warn!("interrupt on GSI {gsi} with no handler; masking");
                intctl::mask_gsi(gsi);
                return;
            }
        }
    };

    if handler.active.load(Ordering::Acquire) {
        // unacknowledged; the edge is dropped by design
        return;
    }

    let payload = KernelInterruptMessage {
        header: MessageHeader {
            msg_type: MSG_TYPE_KERNEL_INTERRUPT,
            flags: 0,
        },
        vector: gsi,
        cpu_id: cpu as u32,
    };

    let delivered = handler
        .port
        .upgrade()
        .filter(|port| port.is_alive())
        .is_some_and(|port| port.send_from_system(payload.as_bytes().to_vec()).is_ok());

    if delivered {
        handler.active.store(true, Ordering::Release);
        intctl::begin_handling(gsi);
    } else {
        // nobody is listening anymore
        let mut table = tables[cpu].lock();
        if let Ok(position) = find(&table, gsi) {
            table.remove(position);
        }
        intctl::mask_gsi(gsi);
        if let Some(owner) = handler.owner.upgrade() {
            owner.unregister_handler(gsi);
        }
    }
}

/// The user-space acknowledgement: clears `active` and re-enables the
/// source at the controller
pub fn complete(gsi: u32, task: &Arc<Task>) -> Result<(), ErrorStatus> {
    let cpu = task.assigned_cpu();
    let table = tables()[cpu].lock();

    let Ok(position) = find(&table, gsi) else {
        return Err(ErrorStatus::NotFound);
    };
    let handler = &table[position];
    if handler.owner_id != task.id() {
        return Err(ErrorStatus::WrongOwner);
    }

    if handler.active.swap(false, Ordering::AcqRel) {
        intctl::complete_gsi(gsi, cpu);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        scheduler,
        task::{TaskPriority, TaskStatus},
        utils::types::Name,
    };

    fn handler_task() -> Arc<Task> {
        fn never_runs() -> ! {
            unreachable!()
        }
        let task = Task::create_kernel(
            Name::try_from("irq-test").unwrap(),
            never_runs,
            TaskPriority::Normal,
        )
        .unwrap();
        task.set_assigned_cpu(arch::cpu_index());
        task
    }

    #[test_case]
    fn deliver_suppress_ack_redeliver() {
        let task = handler_task();
        let port = Port::create_for_kernel();
        let gsi = 11;

        install(gsi, &port, &task).unwrap();
        assert_eq!(install(gsi, &port, &task), Err(ErrorStatus::AlreadyExists));

        deliver(gsi);
        let message = port.pop_message().unwrap();
        let body = KernelInterruptMessage::read_from(&message.payload).unwrap();
        assert_eq!(body.vector, gsi);
        assert_eq!(body.cpu_id, arch::cpu_index() as u32);

        // edges before the ack are suppressed
        deliver(gsi);
        deliver(gsi);
        assert!(port.is_empty());

        complete(gsi, &task).unwrap();
        deliver(gsi);
        assert!(!port.is_empty());
        port.pop_message().unwrap();

        complete(gsi, &task).unwrap();
        remove(gsi, &task).unwrap();
        port.destroy();

        task.set_status(TaskStatus::Blocked(crate::task::BlockReason::OnPort {
            port: 0,
            deadline_ms: 0,
        }));
        task.atomic_kill();
        let _ = scheduler::reap_now(&task);
    }

    #[test_case]
    fn dead_port_tears_the_handler_down() {
        let task = handler_task();
        let port = Port::create_for_kernel();
        let gsi = 12;

        install(gsi, &port, &task).unwrap();
        port.destroy();

        deliver(gsi);
        // the handler removed itself; a fresh install works again
        let port2 = Port::create_for_kernel();
        install(gsi, &port2, &task).unwrap();
        remove(gsi, &task).unwrap();
        port2.destroy();

        task.set_status(TaskStatus::Blocked(crate::task::BlockReason::OnPort {
            port: 0,
            deadline_ms: 0,
        }));
        task.atomic_kill();
    }
}
