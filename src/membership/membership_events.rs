use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::ids::MemberId;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MembershipEvent {
    MemberJoined(MemberId),
    /// explicit leave, either a local member closing or a MEMBER_LEAVING packet
    MemberLeft(MemberId),
    /// a remote member that stopped announcing itself
    MemberExpired(MemberId),
}

impl MembershipEvent {
    pub fn member_id(&self) -> MemberId {
        match self {
            MembershipEvent::MemberJoined(id) => *id,
            MembershipEvent::MemberLeft(id) => *id,
            MembershipEvent::MemberExpired(id) => *id,
        }
    }
}

pub struct MembershipEventNotifier {
    sender: broadcast::Sender<MembershipEvent>,
}
impl MembershipEventNotifier {
    pub fn new() -> MembershipEventNotifier {
        let (sender, _) = broadcast::channel(128);

        MembershipEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: MembershipEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
