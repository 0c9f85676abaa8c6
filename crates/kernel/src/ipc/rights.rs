//! Transferable send rights.
//!
//! A right is the capability to send to one port. It lives indexed in its
//! owning task group (by sender-facing id) and in its port (by serial), or
//! in the `of-message` state while a message carries it. Send-once rights
//! consume themselves on their first successful send.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{sync::Arc, sync::Weak, vec::Vec};
use portal_abi::{consts::MESSAGE_RIGHTS_MAX, errors::ErrorStatus};

use crate::{
    task::group::TaskGroup,
    utils::locks::{SpinLock, SpinLockGuard},
};

use super::{Message, Port};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightType {
    SendOnce,
    SendMany,
}

#[derive(Debug)]
enum RightState {
    /// owned by a task group, reachable by its sender id there
    InGroup { group: Weak<TaskGroup>, sender_id: u64 },
    /// attached to an in-flight message, owned by it alone
    OfMessage,
    Dead,
}

#[derive(Debug)]
pub struct Right {
    /// port-side index key; globally unique and never reused
    serial: u64,
    /// parent-facing id the port's owner chose when creating the right;
    /// receivers see it as `sent_under`
    parent_id: u64,
    port: Weak<Port>,
    rtype: RightType,
    state: SpinLock<RightState>,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

impl Right {
    /// Creates a right to `port` owned by `group`. Atomic with respect to a
    /// concurrent destroy: the right is alive and indexed on both sides
    /// before the id escapes.
    pub fn create_for_group(
        port: &Arc<Port>,
        group: &Arc<TaskGroup>,
        rtype: RightType,
        parent_id: u64,
    ) -> Result<(Arc<Right>, u64), ErrorStatus> {
        if !port.is_alive() {
            return Err(ErrorStatus::PortDead);
        }

        let sender_id = group.alloc_sender_id();
        let right = Arc::new(Right {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            parent_id,
            port: Arc::downgrade(port),
            rtype,
            state: SpinLock::new(RightState::InGroup {
                group: Arc::downgrade(group),
                sender_id,
            }),
        });

        group.index_right(sender_id, right.clone());
        port.index_right(&right);

        // the port may have died between the check and the indexing
        if !port.is_alive() {
            let _ = right.destroy(None);
            return Err(ErrorStatus::PortDead);
        }

        Ok((right, sender_id))
    }

    pub const fn serial(&self) -> u64 {
        self.serial
    }

    pub const fn parent_id(&self) -> u64 {
        self.parent_id
    }

    pub const fn right_type(&self) -> RightType {
        self.rtype
    }

    pub fn port(&self) -> Option<Arc<Port>> {
        self.port.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            &*self.state.lock(),
            RightState::InGroup { .. } | RightState::OfMessage
        ) && self.port.upgrade().is_some_and(|port| port.is_alive())
    }

    fn owner(&self) -> Option<Arc<TaskGroup>> {
        match &*self.state.lock() {
            RightState::InGroup { group, .. } => group.upgrade(),
            _ => None,
        }
    }

    pub fn of_group(&self, group: &Arc<TaskGroup>) -> bool {
        self.owner().is_some_and(|owner| Arc::ptr_eq(&owner, group))
    }

    /// Destroys the right, unlinking both indexes. With `match_group` set
    /// the destroy only proceeds if that group owns the right.
    pub fn destroy(self: &Arc<Self>, match_group: Option<&Arc<TaskGroup>>) -> Result<(), ErrorStatus> {
        let mut state = self.state.lock();

        match &*state {
            RightState::Dead => return Err(ErrorStatus::RightDead),
            RightState::OfMessage => {
                if match_group.is_some() {
                    return Err(ErrorStatus::WrongOwner);
                }
            }
            RightState::InGroup { group, sender_id } => {
                let owner = group.upgrade();
                if let Some(expected) = match_group
                    && !owner.as_ref().is_some_and(|owner| Arc::ptr_eq(owner, expected))
                {
                    return Err(ErrorStatus::WrongOwner);
                }
                if let Some(owner) = owner {
                    owner.unindex_right(*sender_id);
                }
            }
        }

        *state = RightState::Dead;
        drop(state);

        if let Some(port) = self.port.upgrade() {
            port.unindex_right(self.serial);
        }
        Ok(())
    }

    /// The message-destruction path: no owner checks, already detached from
    /// any group
    pub fn destroy_from_message(self: &Arc<Self>) {
        let _ = self.destroy(None);
    }

    /// Duplicates a send-many right inside `group`, returning the new right
    /// and its sender id
    pub fn duplicate(self: &Arc<Self>, group: &Arc<TaskGroup>) -> Result<(Arc<Right>, u64), ErrorStatus> {
        if self.rtype == RightType::SendOnce {
            return Err(ErrorStatus::InvalidArgument);
        }
        if !self.of_group(group) {
            return Err(ErrorStatus::WrongOwner);
        }
        let port = self.port.upgrade().ok_or(ErrorStatus::PortDead)?;

        Right::create_for_group(&port, group, self.rtype, self.parent_id)
    }

    /// Moves the right from one group's namespace to another's, returning
    /// its new sender id
    pub fn transfer_to_group(
        self: &Arc<Self>,
        from: &Arc<TaskGroup>,
        to: &Arc<TaskGroup>,
    ) -> Result<u64, ErrorStatus> {
        let mut state = self.state.lock();

        let RightState::InGroup { group, sender_id } = &*state else {
            return Err(ErrorStatus::RightDead);
        };
        if !group.upgrade().is_some_and(|owner| Arc::ptr_eq(&owner, from)) {
            return Err(ErrorStatus::WrongOwner);
        }

        from.unindex_right(*sender_id);
        let new_id = to.alloc_sender_id();
        to.index_right(new_id, self.clone());
        *state = RightState::InGroup {
            group: Arc::downgrade(to),
            sender_id: new_id,
        };

        Ok(new_id)
    }

    /// detaches the right from its group into the `of-message` state; the
    /// caller holds the message being assembled
    fn detach_for_message(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if let RightState::InGroup { group, sender_id } = &*state {
            if let Some(owner) = group.upgrade() {
                owner.unindex_right(*sender_id);
            }
            *state = RightState::OfMessage;
        }
    }

    /// the receive path: attaches an `of-message` right to the receiver's
    /// group, returning its fresh sender id (0 when the right died in flight)
    pub fn attach_to_group(self: &Arc<Self>, group: &Arc<TaskGroup>) -> u64 {
        let mut state = self.state.lock();
        match &*state {
            RightState::OfMessage => {
                let sender_id = group.alloc_sender_id();
                *state = RightState::InGroup {
                    group: Arc::downgrade(group),
                    sender_id,
                };
                drop(state);
                group.index_right(sender_id, self.clone());
                sender_id
            }
            _ => 0,
        }
    }
}

/// Locks a set of rights in canonical (address-sorted) order, so concurrent
/// multi-right sends can never deadlock against each other
fn lock_rights_sorted<'a>(rights: &'a [&Arc<Right>]) -> Vec<SpinLockGuard<'a, RightState>> {
    let mut sorted: Vec<&&Arc<Right>> = rights.iter().collect();
    sorted.sort_by_key(|right| Arc::as_ptr(right) as usize);
    sorted
        .into_iter()
        .map(|right| right.state.lock())
        .collect()
}

/// Sends `payload` through `right` on behalf of `group`.
///
/// Up to [`MESSAGE_RIGHTS_MAX`] rights move into the message; when
/// `reply_port` is given a fresh send-once reply right rides along. A
/// send-once `right` is consumed by a successful send. Failure after
/// validation restores every carried right to its group.
pub fn send_message_right(
    right: &Arc<Right>,
    group: &Arc<TaskGroup>,
    payload: Vec<u8>,
    carried: &[Arc<Right>],
    reply_port: Option<&Arc<Port>>,
    sender_task: u64,
) -> Result<(), ErrorStatus> {
    if carried.len() > MESSAGE_RIGHTS_MAX {
        return Err(ErrorStatus::InvalidArgument);
    }
    // a right cannot ride in a message sent through itself, and duplicates
    // would deadlock the sorted locking below
    for (i, a) in carried.iter().enumerate() {
        if Arc::ptr_eq(a, right) || carried[..i].iter().any(|b| Arc::ptr_eq(a, b)) {
            return Err(ErrorStatus::InvalidArgument);
        }
    }

    let port = right.port.upgrade().ok_or(ErrorStatus::RightDead)?;

    // validate everything under the sorted locks, then release before the
    // state transitions (each of which relocks one right at a time)
    {
        let mut to_lock: Vec<&Arc<Right>> = Vec::with_capacity(carried.len() + 1);
        to_lock.push(right);
        to_lock.extend(carried.iter());
        let guards = lock_rights_sorted(&to_lock);

        for guard in guards.iter() {
            match &**guard {
                RightState::InGroup { group: owner, .. } => {
                    if !owner.upgrade().is_some_and(|owner| Arc::ptr_eq(&owner, group)) {
                        return Err(ErrorStatus::WrongOwner);
                    }
                }
                RightState::OfMessage | RightState::Dead => return Err(ErrorStatus::RightDead),
            }
        }
    }

    if !port.is_alive() {
        return Err(ErrorStatus::PortDead);
    }

    // assemble the reply right first so a dead reply port aborts cleanly
    let reply_right = match reply_port {
        Some(reply_port) => {
            if !reply_port.is_alive() {
                return Err(ErrorStatus::PortDead);
            }
            let reply = Arc::new(Right {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                parent_id: 0,
                port: Arc::downgrade(reply_port),
                rtype: RightType::SendOnce,
                state: SpinLock::new(RightState::OfMessage),
            });
            reply_port.index_right(&reply);
            Some(reply)
        }
        None => None,
    };

    let mut message = Message {
        sender: sender_task,
        payload,
        reply_right,
        rights: [const { None }; MESSAGE_RIGHTS_MAX],
        sent_under: right.parent_id,
    };
    for (slot, carried_right) in message.rights.iter_mut().zip(carried.iter()) {
        carried_right.detach_for_message();
        *slot = Some(carried_right.clone());
    }

    match port.enqueue(message) {
        Ok(()) => {
            if right.rtype == RightType::SendOnce {
                let _ = right.destroy(None);
            }
            Ok(())
        }
        Err(returned) => {
            // the port died mid-send: put the carried rights back where they
            // were; dropping the message would destroy them instead
            let mut returned = returned;
            for slot in &mut returned.rights {
                if let Some(carried_right) = slot.take() {
                    carried_right.attach_to_group(group);
                }
            }
            // the reply right (if any) dies with what remains of the message
            drop(returned);
            Err(ErrorStatus::PortDead)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ipc::port::Port, task::group::TaskGroup};

    fn test_group() -> Arc<TaskGroup> {
        TaskGroup::create()
    }

    fn test_port() -> Arc<Port> {
        Port::create_for_kernel()
    }

    #[test_case]
    fn send_once_is_consumed_exactly_once() {
        let group = test_group();
        let port = test_port();

        let (right, _id) =
            Right::create_for_group(&port, &group, RightType::SendOnce, 7).unwrap();
        assert!(right.is_alive());

        send_message_right(&right, &group, alloc::vec![1, 2, 3], &[], None, 1).unwrap();
        assert!(!right.is_alive());

        // the second send observes the dead right
        assert_eq!(
            send_message_right(&right, &group, alloc::vec![4], &[], None, 1),
            Err(ErrorStatus::RightDead)
        );

        let message = port.pop_message().unwrap();
        assert_eq!(message.payload, alloc::vec![1, 2, 3]);
        assert_eq!(message.sent_under, 7);
        port.destroy();
    }

    #[test_case]
    fn send_many_survives_sends() {
        let group = test_group();
        let port = test_port();

        let (right, _) = Right::create_for_group(&port, &group, RightType::SendMany, 1).unwrap();
        for i in 0..3u8 {
            send_message_right(&right, &group, alloc::vec![i], &[], None, 1).unwrap();
        }
        assert!(right.is_alive());

        // FIFO order out
        for i in 0..3u8 {
            assert_eq!(port.pop_message().unwrap().payload, alloc::vec![i]);
        }
        right.destroy(Some(&group)).unwrap();
        port.destroy();
    }

    #[test_case]
    fn carried_rights_move_between_groups() {
        let sender_group = test_group();
        let receiver_group = test_group();
        let port = test_port();
        let other_port = test_port();

        let (right, _) = Right::create_for_group(&port, &sender_group, RightType::SendMany, 1).unwrap();
        let (carried, carried_id) =
            Right::create_for_group(&other_port, &sender_group, RightType::SendMany, 2).unwrap();

        send_message_right(
            &right,
            &sender_group,
            alloc::vec![],
            &[carried.clone()],
            None,
            1,
        )
        .unwrap();

        // no longer reachable in the sender's namespace
        assert!(sender_group.find_right(carried_id).is_none());

        let mut message = port.pop_message().unwrap();
        let moved = message.rights[0].take().unwrap();
        let new_id = moved.attach_to_group(&receiver_group);
        assert!(new_id != 0);
        assert!(receiver_group.find_right(new_id).is_some());

        moved.destroy(Some(&receiver_group)).unwrap();
        right.destroy(Some(&sender_group)).unwrap();
        port.destroy();
        other_port.destroy();
    }

    #[test_case]
    fn port_death_kills_rights() {
        let group = test_group();
        let port = test_port();

        let (right, id) = Right::create_for_group(&port, &group, RightType::SendMany, 1).unwrap();
        port.destroy();

        assert!(!right.is_alive());
        assert_eq!(
            send_message_right(&right, &group, alloc::vec![], &[], None, 1),
            Err(ErrorStatus::RightDead)
        );
        // destroyed rights disappear from the group index too
        assert!(group.find_right(id).is_none());
    }
}
