use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::protocol::ids::{MemberId, MessageId};


/// An application message. Messages are created by [crate::group::member::Member::create_new_message]
///  with an empty payload, which the application then sets before sending.
///
/// NB: Sending the same message again (e.g. after a delivery failure) is safe: receivers that
///  already got it acknowledge it again without delivering it a second time.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    id: MessageId,
    sender: MemberId,
    group: String,
    payload: Bytes,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{id:{:?},sender:{:?},group:{:?},len:{}}}", self.id, self.sender, self.group, self.payload.len())
    }
}

impl Message {
    pub fn new(id: MessageId, sender: MemberId, group: &str, payload: Bytes) -> Message {
        Message {
            id,
            sender,
            group: group.to_string(),
            payload,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> MemberId {
        self.sender
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
    }
}

/// Receives completed messages sent by other members of a group. Listeners are called from a
///  group's delivery task, one message at a time, so a slow listener delays delivery of
///  subsequent messages in the same group, but it does not block the receive loop.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: Arc<Message>);
}
