use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::error::GroupError;
use crate::group::group::Group;
use crate::group::groups::GroupsInner;
use crate::membership::member_registry::MemberInfo;
use crate::membership::membership_events::MembershipEvent;
use crate::messaging::message::{Message, MessageListener};
use crate::net_time::NetTimestamp;
use crate::protocol::ids::{MemberId, MessageId};


/// A local member of a group, i.e. the handle through which an application participates in a
///  group. Clones refer to the same member.
///
/// A member stays in the group until [Member::close] is called (or the [crate::group::groups::Groups]
///  registry is shut down). Dropping the handle does not leave the group.
#[derive(Clone)]
pub struct Member {
    inner: Arc<MemberInner>,
}

struct MemberInner {
    id: MemberId,
    groups: Arc<GroupsInner>,
    group: Arc<Group>,
    closed: watch::Receiver<bool>,
}

impl Debug for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Member{{id:{:?},group:{:?}}}", self.inner.id, self.inner.group.name())
    }
}

impl Member {
    pub(crate) fn new(groups: Arc<GroupsInner>, group: Arc<Group>, id: MemberId, closed: watch::Receiver<bool>) -> Member {
        Member {
            inner: Arc::new(MemberInner {
                id,
                groups,
                group,
                closed,
            }),
        }
    }

    pub fn id(&self) -> MemberId {
        self.inner.id
    }

    pub fn group_name(&self) -> &str {
        self.inner.group.name()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Creates a message with a new unique id and an empty payload
    pub fn create_new_message(&self) -> Message {
        Message::new(MessageId::random(), self.inner.id, self.group_name(), Bytes::new())
    }

    /// Sends a message to all other members of the group. This returns successfully only after
    ///  all members that were part of the group when the send started (and are still part of it)
    ///  acknowledged the complete message.
    pub async fn send_message(&self, message: &Message) -> Result<(), GroupError> {
        if message.sender() != self.inner.id || message.group() != self.group_name() {
            return Err(GroupError::Configuration(format!("{:?} was not created by {:?}", message, self)));
        }
        if self.inner.groups.is_receiver_down() {
            return Err(GroupError::ReceiverDown);
        }
        self.inner.group.send(message, self.inner.closed.clone()).await
    }

    pub async fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::MemberClosed);
        }
        self.inner.group.add_message_listener(self.inner.id, listener).await;
        Ok(())
    }

    /// Listeners are identified by reference, i.e. the listener must be the same [Arc] that
    ///  was registered. Returns `true` if the listener was registered.
    pub async fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.inner.group.remove_message_listener(self.inner.id, listener).await
    }

    /// All members of the group this member knows about, including itself
    pub async fn get_member_info(&self) -> Vec<MemberInfo> {
        self.inner.group.registry().snapshot().await
    }

    pub fn subscribe_membership_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.inner.group.registry().subscribe()
    }

    /// The group's current net time
    pub fn get_now(&self) -> NetTimestamp {
        self.inner.group.net_time().timestamp_now()
    }

    pub fn create_from_net_time(&self, net_millis: i64) -> NetTimestamp {
        self.inner.group.net_time().timestamp_from_net(net_millis)
    }

    pub fn create_from_local_time(&self, local_millis: i64) -> NetTimestamp {
        self.inner.group.net_time().timestamp_from_local(local_millis)
    }

    /// Leaves the group: sends MEMBER_LEAVING, waits for the configured grace period and
    ///  releases the member's resources. Sends that are in progress fail with
    ///  [GroupError::MemberClosed]. Closing a member more than once has no effect.
    pub async fn close(&self) {
        self.inner.groups.leave(&self.inner.group, self.inner.id).await;
    }
}
