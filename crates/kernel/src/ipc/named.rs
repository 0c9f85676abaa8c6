//! The named-port registry.
//!
//! Names are plain ASCII strings; path-like names are a user-space
//! convention the kernel does not interpret. Requests against an unbound
//! name queue an action that fires on bind; unbinding (the bound port
//! dying) fails the waiting side instead of leaving it parked forever.

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use portal_abi::{
    errors::ErrorStatus,
    ipc::{MSG_TYPE_NAMED_PORT_NOTIFICATION, MessageHeader, NamedPortNotification},
};

use crate::{task::Task, utils::locks::Mutex};

use super::Port;

#[derive(Debug)]
enum NamedPortAction {
    /// deliver a `NamedPortNotification` to this port when the name binds
    SendMessage { reply_port: Weak<Port> },
    /// wake this task so it can re-check (the blocking-request form); it
    /// observes `NotFound` if the name was dropped instead
    NotifyTask { task: Weak<Task> },
}

#[derive(Debug, Default)]
struct NamedPortDesc {
    parent_port: Option<Weak<Port>>,
    actions: Vec<NamedPortAction>,
}

lazy_static! {
    static ref NAMED_PORTS: Mutex<HashMap<String, NamedPortDesc>> = Mutex::new(HashMap::new());
}

fn notification_payload(port_id: u64, name: &str) -> Vec<u8> {
    let header = NamedPortNotification {
        header: MessageHeader {
            msg_type: MSG_TYPE_NAMED_PORT_NOTIFICATION,
            flags: 0,
        },
        port_id,
    };

    let mut payload = Vec::with_capacity(size_of::<NamedPortNotification>() + name.len());
    payload.extend_from_slice(header.as_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload
}

/// Binds `name` to `port` and fires every pending action
pub fn bind(name: &str, port: &Arc<Port>) -> Result<(), ErrorStatus> {
    if name.is_empty() || !name.is_ascii() {
        return Err(ErrorStatus::InvalidArgument);
    }
    if !port.is_alive() {
        return Err(ErrorStatus::PortDead);
    }

    let pending = {
        let mut registry = NAMED_PORTS.lock();
        let desc = registry.entry(String::from(name)).or_default();

        if desc
            .parent_port
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|bound| bound.is_alive())
        {
            return Err(ErrorStatus::AlreadyExists);
        }

        desc.parent_port = Some(Arc::downgrade(port));
        core::mem::take(&mut desc.actions)
    };

    for action in pending {
        match action {
            NamedPortAction::SendMessage { reply_port } => {
                if let Some(reply_port) = reply_port.upgrade() {
                    let _ = reply_port.send_from_system(notification_payload(port.id(), name));
                }
            }
            NamedPortAction::NotifyTask { task } => {
                if let Some(task) = task.upgrade() {
                    crate::scheduler::unblock(&task);
                }
            }
        }
    }

    Ok(())
}

/// the bound port for `name`, if the name is live
pub fn get(name: &str) -> Option<Arc<Port>> {
    NAMED_PORTS
        .lock()
        .get(name)?
        .parent_port
        .as_ref()?
        .upgrade()
        .filter(|port| port.is_alive())
}

/// Requests a `NamedPortNotification` on `reply_port`: synchronously when
/// the name is already bound, on bind otherwise
pub fn request(name: &str, reply_port: &Arc<Port>) -> Result<(), ErrorStatus> {
    if name.is_empty() || !name.is_ascii() {
        return Err(ErrorStatus::InvalidArgument);
    }

    let bound = {
        let mut registry = NAMED_PORTS.lock();
        let desc = registry.entry(String::from(name)).or_default();

        match desc
            .parent_port
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|port| port.is_alive())
        {
            Some(bound) => Some(bound),
            None => {
                desc.actions.push(NamedPortAction::SendMessage {
                    reply_port: Arc::downgrade(reply_port),
                });
                None
            }
        }
    };

    if let Some(bound) = bound {
        reply_port
            .send_from_system(notification_payload(bound.id(), name))
            .map_err(|_| ErrorStatus::PortDead)?;
    }
    Ok(())
}

/// Parks the waiting form: the caller blocks and gets woken on bind
pub fn add_waiter(name: &str, task: &Arc<Task>) -> Result<(), ErrorStatus> {
    if name.is_empty() || !name.is_ascii() {
        return Err(ErrorStatus::InvalidArgument);
    }

    let mut registry = NAMED_PORTS.lock();
    let desc = registry.entry(String::from(name)).or_default();
    desc.actions.push(NamedPortAction::NotifyTask {
        task: Arc::downgrade(task),
    });
    Ok(())
}

/// A port died: unbind any name it backed and fail the waiting tasks (they
/// wake and observe the name gone)
pub fn handle_port_death(port_id: u64) {
    let mut woken = Vec::new();
    {
        let mut registry = NAMED_PORTS.lock();
        registry.retain(|_, desc| {
            let was_bound_here = desc
                .parent_port
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|port| port.id() == port_id);
            if !was_bound_here {
                return true;
            }

            desc.parent_port = None;
            for action in desc.actions.drain(..) {
                if let NamedPortAction::NotifyTask { task } = action {
                    woken.push(task);
                }
            }
            false
        });
    }

    for task in woken {
        if let Some(task) = task.upgrade() {
            crate::scheduler::unblock(&task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn rendezvous_pending_then_synchronous() {
        let observer = Port::create_for_kernel();
        let service = Port::create_for_kernel();

        // request before the bind: nothing yet
        request("svc-test", &observer).unwrap();
        assert!(observer.is_empty());

        bind("svc-test", &service).unwrap();

        // the pending action fired
        let message = observer.pop_message().unwrap();
        let notification = NamedPortNotification::read_from(&message.payload).unwrap();
        assert_eq!(notification.port_id, service.id());
        assert_eq!(
            &message.payload[size_of::<NamedPortNotification>()..],
            b"svc-test"
        );

        // a later request resolves synchronously
        request("svc-test", &observer).unwrap();
        let message = observer.pop_message().unwrap();
        let notification = NamedPortNotification::read_from(&message.payload).unwrap();
        assert_eq!(notification.port_id, service.id());

        assert!(get("svc-test").is_some());
        service.destroy();
        assert!(get("svc-test").is_none());
        observer.destroy();
    }

    #[test_case]
    fn double_bind_is_rejected() {
        let first = Port::create_for_kernel();
        let second = Port::create_for_kernel();

        bind("unique-test", &first).unwrap();
        assert_eq!(bind("unique-test", &second), Err(ErrorStatus::AlreadyExists));

        // the name frees up when its port dies
        first.destroy();
        bind("unique-test", &second).unwrap();
        second.destroy();
    }
}
