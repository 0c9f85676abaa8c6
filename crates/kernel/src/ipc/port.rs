//! Ports: FIFO message queues owned by tasks.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Weak},
    vec::Vec,
};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use portal_abi::errors::ErrorStatus;

use crate::{
    task::Task,
    utils::locks::{RwLock, SpinLock},
};

use super::{Message, Right};

#[derive(Debug)]
struct PortInner {
    queue: VecDeque<Message>,
    /// lifetime counters backing `is_empty`'s invariant with the queue
    enqueued: u64,
    dequeued: u64,
    /// tasks parked in a blocking receive; woken on enqueue and on
    /// destruction
    waiters: Vec<Weak<Task>>,
}

#[derive(Debug)]
pub struct Port {
    id: u64,
    owner: Weak<Task>,
    owner_id: u64,
    alive: AtomicBool,
    inner: SpinLock<PortInner>,
    /// every right pointing at this port, keyed by serial; destroying the
    /// port sweeps them
    rights: SpinLock<BTreeMap<u64, Weak<Right>>>,
}

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref PORTS: RwLock<HashMap<u64, Arc<Port>>> = RwLock::new(HashMap::new());
}

pub fn lookup(id: u64) -> Option<Arc<Port>> {
    PORTS.read().get(&id).cloned()
}

impl Port {
    fn new(owner: Weak<Task>, owner_id: u64) -> Arc<Self> {
        let port = Arc::new(Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            owner_id,
            alive: AtomicBool::new(true),
            inner: SpinLock::new(PortInner {
                queue: VecDeque::new(),
                enqueued: 0,
                dequeued: 0,
                waiters: Vec::new(),
            }),
            rights: SpinLock::new(BTreeMap::new()),
        });

        PORTS.write().insert(port.id, port.clone());
        port
    }

    /// Creates a port owned by `task`. Holds the task's status lock across
    /// the liveness check and the registration, so a task dying concurrently
    /// either sees the port (and reaps it) or the creation fails.
    pub fn atomic_create_port(task: &Arc<Task>) -> Result<Arc<Self>, ErrorStatus> {
        let status = task.status_lock();
        if task.is_dead() {
            return Err(ErrorStatus::NotFound);
        }

        let port = Self::new(Arc::downgrade(task), task.id());
        task.register_owned_port(port.id);
        drop(status);
        Ok(port)
    }

    /// ports the kernel itself owns (timers, tests)
    pub fn create_for_kernel() -> Arc<Self> {
        Self::new(Weak::new(), 0)
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn owner_id(&self) -> u64 {
        self.owner_id
    }

    pub fn owner(&self) -> Option<Arc<Task>> {
        self.owner.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        debug_assert_eq!(
            inner.queue.is_empty(),
            inner.enqueued == inner.dequeued,
            "queue length diverged from its lifetime counters"
        );
        inner.queue.is_empty()
    }

    /// Queues a message and wakes the parked receivers. A dead port hands
    /// the message back so the sender can restore carried rights.
    pub fn enqueue(&self, message: Message) -> Result<(), Message> {
        let mut inner = self.inner.lock();
        if !self.is_alive() {
            return Err(message);
        }

        inner.queue.push_back(message);
        inner.enqueued += 1;

        let waiters = core::mem::take(&mut inner.waiters);
        drop(inner);
        for waiter in waiters {
            if let Some(task) = waiter.upgrade() {
                crate::scheduler::unblock(&task);
            }
        }
        Ok(())
    }

    /// kernel-originated payload; never blocks, drops silently on a dead
    /// port (the caller cannot do anything about it)
    pub fn send_from_system(&self, payload: Vec<u8>) -> Result<(), ErrorStatus> {
        self.enqueue(Message::from_system(payload))
            .map_err(|_| ErrorStatus::PortDead)
    }

    /// A bare user send addressed by port id: payload only, no rights. The
    /// sender's identity travels with the message.
    pub fn send_from_user(&self, sender: u64, payload: Vec<u8>) -> Result<(), ErrorStatus> {
        let message = Message {
            sender,
            payload,
            reply_right: None,
            rights: [const { None }; portal_abi::consts::MESSAGE_RIGHTS_MAX],
            sent_under: 0,
        };
        self.enqueue(message).map_err(|_| ErrorStatus::PortDead)
    }

    /// dequeues the head message
    pub fn pop_message(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let message = inner.queue.pop_front();
        if message.is_some() {
            inner.dequeued += 1;
        }
        message
    }

    /// puts a message back at the head (a receive that could not complete)
    pub fn requeue_front(&self, message: Message) {
        let mut inner = self.inner.lock();
        inner.queue.push_front(message);
        inner.dequeued -= 1;
    }

    /// The blocking receive: dequeues the head message, or — atomically with
    /// the emptiness check — parks `task` on the waiter list and marks it
    /// blocked. Holding the queue lock across both is what makes a racing
    /// enqueue either hand us the message or see the waiter.
    pub fn receive_or_park(&self, task: &Arc<Task>, deadline_ms: u64) -> Option<Message> {
        let mut inner = self.inner.lock();

        if let Some(message) = inner.queue.pop_front() {
            inner.dequeued += 1;
            return Some(message);
        }

        inner.waiters.push(Arc::downgrade(task));
        task.set_status(crate::task::TaskStatus::Blocked(
            crate::task::BlockReason::OnPort {
                port: self.id,
                deadline_ms,
            },
        ));
        None
    }

    /// drops a parked task (timeout, kill) from the waiter list
    pub fn remove_waiter(&self, task: &Arc<Task>) {
        let mut inner = self.inner.lock();
        inner
            .waiters
            .retain(|waiter| !waiter.upgrade().is_some_and(|other| Arc::ptr_eq(&other, task)));
    }

    pub(super) fn index_right(&self, right: &Arc<Right>) {
        self.rights
            .lock()
            .insert(right.serial(), Arc::downgrade(right));
    }

    pub(super) fn unindex_right(&self, serial: u64) {
        self.rights.lock().remove(&serial);
    }

    /// Tears the port down: unregisters it, kills every right referring to
    /// it, drops queued messages (destroying the rights they carry), wakes
    /// parked receivers so they observe `PortDead`, and fails pending
    /// named-port actions.
    pub fn destroy(&self) {
        if self.alive.swap(false, Ordering::AcqRel) == false {
            return;
        }

        PORTS.write().remove(&self.id);

        let rights: Vec<Weak<Right>> = {
            let mut index = self.rights.lock();
            core::mem::take(&mut *index).into_values().collect()
        };
        for right in rights {
            if let Some(right) = right.upgrade() {
                let _ = right.destroy(None);
            }
        }

        let (messages, waiters) = {
            let mut inner = self.inner.lock();
            let messages = core::mem::take(&mut inner.queue);
            inner.dequeued += messages.len() as u64;
            (messages, core::mem::take(&mut inner.waiters))
        };
        drop(messages);

        for waiter in waiters {
            if let Some(task) = waiter.upgrade() {
                crate::scheduler::unblock(&task);
            }
        }

        super::named::handle_port_death(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn fifo_and_emptiness() {
        let port = Port::create_for_kernel();
        assert!(port.is_empty());

        for i in 0..4u8 {
            port.send_from_system(alloc::vec![i]).unwrap();
        }
        assert!(!port.is_empty());

        for i in 0..4u8 {
            assert_eq!(port.pop_message().unwrap().payload, alloc::vec![i]);
        }
        assert!(port.is_empty());
        assert!(port.pop_message().is_none());

        port.destroy();
        assert_eq!(
            port.send_from_system(alloc::vec![]),
            Err(ErrorStatus::PortDead)
        );
    }

    #[test_case]
    fn registry_lifecycle() {
        let port = Port::create_for_kernel();
        let id = port.id();
        assert!(lookup(id).is_some());

        port.destroy();
        assert!(lookup(id).is_none());
        // destroy is idempotent
        port.destroy();
    }
}
