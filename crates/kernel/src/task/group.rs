//! Task groups: a rights namespace plus lifecycle notifications.
//!
//! Tasks can belong to several groups; a group owns the rights its members
//! send through, and ports can subscribe to membership changes with a mask.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use portal_abi::{
    errors::ErrorStatus,
    ipc::{
        GROUP_EVENT_TASK_ADDED, GROUP_EVENT_TASK_REMOVED, GroupDestroyed, GroupTaskChanged,
        MSG_TYPE_GROUP_DESTROYED, MSG_TYPE_GROUP_TASK_CHANGED, MessageHeader,
    },
    task::{
        NOTIFY_FOR_EXISTING_TASKS, NOTIFY_GROUP_DESTROYED, NOTIFY_TASK_ADDED, NOTIFY_TASK_REMOVED,
    },
};

use crate::{
    ipc::{Port, Right},
    task::Task,
    utils::locks::{RwLock, SpinLock},
};

#[derive(Debug)]
struct GroupRights {
    by_sender_id: BTreeMap<u64, Arc<Right>>,
    next_sender_id: u64,
}

#[derive(Debug)]
struct Notifier {
    port: Weak<Port>,
    mask: u32,
}

#[derive(Debug)]
pub struct TaskGroup {
    id: u64,
    alive: AtomicBool,
    tasks: SpinLock<BTreeMap<u64, Weak<Task>>>,
    rights: SpinLock<GroupRights>,
    notifiers: SpinLock<Vec<Notifier>>,
}

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref GROUPS: RwLock<HashMap<u64, Arc<TaskGroup>>> = RwLock::new(HashMap::new());
}

pub fn lookup(id: u64) -> Option<Arc<TaskGroup>> {
    GROUPS.read().get(&id).cloned()
}

impl TaskGroup {
    pub fn create() -> Arc<Self> {
        let group = Arc::new(Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            alive: AtomicBool::new(true),
            tasks: SpinLock::new(BTreeMap::new()),
            rights: SpinLock::new(GroupRights {
                by_sender_id: BTreeMap::new(),
                next_sender_id: 1,
            }),
            notifiers: SpinLock::new(Vec::new()),
        });

        GROUPS.write().insert(group.id, group.clone());
        group
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    // --- rights namespace ---

    pub fn alloc_sender_id(&self) -> u64 {
        let mut rights = self.rights.lock();
        let id = rights.next_sender_id;
        rights.next_sender_id += 1;
        id
    }

    pub fn index_right(&self, sender_id: u64, right: Arc<Right>) {
        self.rights.lock().by_sender_id.insert(sender_id, right);
    }

    pub fn unindex_right(&self, sender_id: u64) {
        self.rights.lock().by_sender_id.remove(&sender_id);
    }

    /// rights are looked up by sender id within their group
    pub fn find_right(&self, sender_id: u64) -> Option<Arc<Right>> {
        self.rights.lock().by_sender_id.get(&sender_id).cloned()
    }

    // --- membership ---

    pub fn contains_task(&self, task_id: u64) -> bool {
        self.tasks.lock().contains_key(&task_id)
    }

    pub fn add_task(self: &Arc<Self>, task: &Arc<Task>) -> Result<(), ErrorStatus> {
        if !self.is_alive() {
            return Err(ErrorStatus::NotFound);
        }

        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&task.id()) {
                return Err(ErrorStatus::AlreadyExists);
            }
            tasks.insert(task.id(), Arc::downgrade(task));
        }
        task.register_group(self.clone());

        self.notify_task_change(GROUP_EVENT_TASK_ADDED, task.id());
        Ok(())
    }

    pub fn remove_task(self: &Arc<Self>, task: &Arc<Task>) -> Result<(), ErrorStatus> {
        if self.tasks.lock().remove(&task.id()).is_none() {
            return Err(ErrorStatus::NotFound);
        }
        task.unregister_group(self);

        self.notify_task_change(GROUP_EVENT_TASK_REMOVED, task.id());

        if self.tasks.lock().is_empty() {
            self.destroy();
        }
        Ok(())
    }

    /// the task-death path; like remove but never destroys an already-dead
    /// group twice
    pub fn remove_dead_task(self: &Arc<Self>, task_id: u64) {
        if self.tasks.lock().remove(&task_id).is_none() {
            return;
        }
        self.notify_task_change(GROUP_EVENT_TASK_REMOVED, task_id);
        if self.tasks.lock().is_empty() {
            self.destroy();
        }
    }

    // --- notifications ---

    /// Subscribes `port` with `mask`; `NOTIFY_FOR_EXISTING_TASKS` replays an
    /// `Added` event per current member
    pub fn set_notifier(&self, port: &Arc<Port>, mask: u32) -> Result<(), ErrorStatus> {
        if !port.is_alive() {
            return Err(ErrorStatus::PortDead);
        }

        {
            let mut notifiers = self.notifiers.lock();
            notifiers.retain(|notifier| {
                notifier
                    .port
                    .upgrade()
                    .is_some_and(|existing| existing.id() != port.id() && existing.is_alive())
            });
            if mask & (NOTIFY_TASK_ADDED | NOTIFY_TASK_REMOVED | NOTIFY_GROUP_DESTROYED) != 0 {
                notifiers.push(Notifier {
                    port: Arc::downgrade(port),
                    mask,
                });
            }
        }

        if mask & NOTIFY_FOR_EXISTING_TASKS != 0 && mask & NOTIFY_TASK_ADDED != 0 {
            let members: Vec<u64> = self.tasks.lock().keys().copied().collect();
            for task_id in members {
                let _ = port.send_from_system(self.task_changed_payload(
                    GROUP_EVENT_TASK_ADDED,
                    task_id,
                ));
            }
        }

        Ok(())
    }

    fn task_changed_payload(&self, event: u32, task_id: u64) -> alloc::vec::Vec<u8> {
        GroupTaskChanged {
            header: MessageHeader {
                msg_type: MSG_TYPE_GROUP_TASK_CHANGED,
                flags: 0,
            },
            group_id: self.id,
            task_id,
            event,
            reserved: 0,
        }
        .as_bytes()
        .to_vec()
    }

    fn notify_task_change(&self, event: u32, task_id: u64) {
        let wanted = if event == GROUP_EVENT_TASK_ADDED {
            NOTIFY_TASK_ADDED
        } else {
            NOTIFY_TASK_REMOVED
        };

        let notifiers = self.notifiers.lock();
        for notifier in notifiers.iter() {
            if notifier.mask & wanted == 0 {
                continue;
            }
            if let Some(port) = notifier.port.upgrade() {
                let _ = port.send_from_system(self.task_changed_payload(event, task_id));
            }
        }
    }

    /// Tears the group down: kills every right it still owns and tells the
    /// subscribed ports (sender 0)
    pub fn destroy(&self) {
        if self.alive.swap(false, Ordering::AcqRel) == false {
            return;
        }

        GROUPS.write().remove(&self.id);

        let rights: Vec<Arc<Right>> = {
            let mut rights = self.rights.lock();
            core::mem::take(&mut rights.by_sender_id).into_values().collect()
        };
        for right in rights {
            let _ = right.destroy(None);
        }

        let payload = GroupDestroyed {
            header: MessageHeader {
                msg_type: MSG_TYPE_GROUP_DESTROYED,
                flags: 0,
            },
            group_id: self.id,
        }
        .as_bytes()
        .to_vec();

        let notifiers = core::mem::take(&mut *self.notifiers.lock());
        for notifier in notifiers {
            if notifier.mask & NOTIFY_GROUP_DESTROYED == 0 {
                continue;
            }
            if let Some(port) = notifier.port.upgrade() {
                let _ = port.send_from_system(payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn notifications_and_destruction() {
        let group = TaskGroup::create();
        let observer = Port::create_for_kernel();

        group
            .set_notifier(&observer, NOTIFY_TASK_ADDED | NOTIFY_GROUP_DESTROYED)
            .unwrap();

        let group_id = group.id();
        assert!(lookup(group_id).is_some());

        group.destroy();
        assert!(lookup(group_id).is_none());

        let message = observer.pop_message().unwrap();
        assert_eq!(message.sender, 0);
        let destroyed = GroupDestroyed::read_from(&message.payload).unwrap();
        assert_eq!(destroyed.group_id, group_id);

        observer.destroy();
    }

    #[test_case]
    fn retroactive_added_events() {
        fn never_runs() -> ! {
            unreachable!()
        }

        let group = TaskGroup::create();
        let member = crate::task::Task::create_kernel(
            crate::utils::types::Name::try_from("member-test").unwrap(),
            never_runs,
            crate::task::TaskPriority::Low,
        )
        .unwrap();
        group.add_task(&member).unwrap();

        // subscribing with the replay flag surfaces the member immediately
        let observer = Port::create_for_kernel();
        group
            .set_notifier(&observer, NOTIFY_TASK_ADDED | NOTIFY_FOR_EXISTING_TASKS)
            .unwrap();

        let message = observer.pop_message().unwrap();
        let changed = GroupTaskChanged::read_from(&message.payload).unwrap();
        assert_eq!(changed.group_id, group.id());
        assert_eq!(changed.task_id, member.id());
        assert_eq!(changed.event, GROUP_EVENT_TASK_ADDED);

        observer.destroy();
        member.set_status(crate::task::TaskStatus::Blocked(
            crate::task::BlockReason::Sleeping { until_ms: u64::MAX },
        ));
        member.atomic_kill();
    }

    #[test_case]
    fn group_death_kills_owned_rights() {
        let group = TaskGroup::create();
        let port = Port::create_for_kernel();

        let (right, _) =
            Right::create_for_group(&port, &group, crate::ipc::RightType::SendMany, 1).unwrap();
        group.destroy();

        assert!(!right.is_alive());
        port.destroy();
    }
}
