use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::data_receiver::PacketListener;
use crate::membership::member_registry::MemberRegistry;
use crate::protocol::packet::{MessagePacket, PacketType};


/// Maintains a group's [MemberRegistry] based on MEMBER_ANNOUNCE and MEMBER_LEAVING packets.
///
/// Packets sent by local members come back through multicast loopback; they are ignored since
///  local members are added and removed directly.
pub struct MembershipListener {
    registry: Arc<MemberRegistry>,
}

impl MembershipListener {
    pub fn new(registry: Arc<MemberRegistry>) -> MembershipListener {
        MembershipListener {
            registry,
        }
    }
}

#[async_trait]
impl PacketListener for MembershipListener {
    async fn on_packet(&self, packet: &MessagePacket) {
        if self.registry.is_local(packet.sender).await {
            trace!("ignoring {:?} from local member {:?}", packet.packet_type, packet.sender);
            return;
        }

        match packet.packet_type {
            PacketType::MemberAnnounce => self.registry.touch(packet.sender).await,
            PacketType::MemberLeaving => {
                self.registry.remove_member(packet.sender).await;
            }
            _ => {}
        }
    }
}
