//! Messages queued on ports.

use alloc::{sync::Arc, vec::Vec};
use portal_abi::consts::MESSAGE_RIGHTS_MAX;

use super::rights::Right;

/// One queued message. Rights it carries are in the `of-message` state: no
/// task group owns them until the message is received, and they die with
/// the message if it never is.
#[derive(Debug)]
pub struct Message {
    /// sending task id; 0 for kernel-originated messages
    pub sender: u64,
    pub payload: Vec<u8>,
    /// the send-once right a receiver answers through
    pub reply_right: Option<Arc<Right>>,
    pub rights: [Option<Arc<Right>>; MESSAGE_RIGHTS_MAX],
    /// parent-facing id of the right the message was sent under; 0 for
    /// system messages
    pub sent_under: u64,
}

impl Message {
    pub fn from_system(payload: Vec<u8>) -> Self {
        Self {
            sender: 0,
            payload,
            reply_right: None,
            rights: [const { None }; MESSAGE_RIGHTS_MAX],
            sent_under: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn carried_rights_count(&self) -> usize {
        self.rights.iter().filter(|right| right.is_some()).count()
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        // an undelivered message takes its rights with it
        if let Some(reply) = self.reply_right.take() {
            reply.destroy_from_message();
        }
        for slot in &mut self.rights {
            if let Some(right) = slot.take() {
                right.destroy_from_message();
            }
        }
    }
}
