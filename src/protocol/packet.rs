use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;
use crate::protocol::ids::{MemberId, MessageId};
use crate::util::buf::{BufExt, BufMutExt};


/// Group names are sent in every packet, so they are limited to keep the header small
pub const MAX_GROUP_NAME_LEN: usize = 255;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Ack = 2,
    MemberAnnounce = 3,
    MemberLeaving = 4,
    TimeSync = 5,
}

/// A [MessagePacket] is the unit of transmission: every datagram contains exactly one packet.
///
/// Wire format, all numbers in network byte order (BE):
/// ```ascii
///  0: packet type (u8)
///  1: group name length (u16)
///  3: group name (UTF-8)
///  *: sender member id (16 bytes)
///  *: message id (16 bytes)
///  *: sequence number (u32)
///  *: total number of fragments (u32)
///  *: payload length (u32)
///  *: payload
/// ```
///
/// Packets that are not DATA fragments use sequence number 0 and total 1. ACK packets echo
///  sequence number and total of the acknowledged fragment, and their sender is the acknowledging
///  member. TIME_SYNC packets carry the sender's net time (i64 millis) as their payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessagePacket {
    pub packet_type: PacketType,
    pub group: String,
    pub sender: MemberId,
    pub message_id: MessageId,
    pub sequence: u32,
    pub total: u32,
    pub payload: Bytes,
}

impl MessagePacket {
    /// The fixed-size part of the header
    pub const FIXED_HEADER_LEN: usize = 1 + 2 + 16 + 16 + 4 + 4 + 4;
    pub const MAX_HEADER_LEN: usize = Self::FIXED_HEADER_LEN + MAX_GROUP_NAME_LEN;

    pub fn data(group: &str, sender: MemberId, message_id: MessageId, sequence: u32, total: u32, payload: Bytes) -> MessagePacket {
        MessagePacket {
            packet_type: PacketType::Data,
            group: group.to_string(),
            sender,
            message_id,
            sequence,
            total,
            payload,
        }
    }

    pub fn ack(group: &str, acking_member: MemberId, message_id: MessageId, sequence: u32, total: u32) -> MessagePacket {
        MessagePacket {
            packet_type: PacketType::Ack,
            group: group.to_string(),
            sender: acking_member,
            message_id,
            sequence,
            total,
            payload: Bytes::new(),
        }
    }

    pub fn announce(group: &str, sender: MemberId) -> MessagePacket {
        Self::control(PacketType::MemberAnnounce, group, sender, Bytes::new())
    }

    pub fn leaving(group: &str, sender: MemberId) -> MessagePacket {
        Self::control(PacketType::MemberLeaving, group, sender, Bytes::new())
    }

    pub fn time_sync(group: &str, sender: MemberId, net_millis: i64) -> MessagePacket {
        Self::control(PacketType::TimeSync, group, sender, Bytes::copy_from_slice(&net_millis.to_be_bytes()))
    }

    fn control(packet_type: PacketType, group: &str, sender: MemberId, payload: Bytes) -> MessagePacket {
        MessagePacket {
            packet_type,
            group: group.to_string(),
            sender,
            message_id: MessageId::NONE,
            sequence: 0,
            total: 1,
            payload,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_HEADER_LEN + self.group.len() + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type.into());
        buf.put_string(&self.group);
        buf.put_u128(self.sender.as_u128());
        buf.put_u128(self.message_id.as_u128());
        buf.put_u32(self.sequence);
        buf.put_u32(self.total);
        buf.put_payload(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a complete datagram. Trailing data is rejected, as is a sequence number that is
    ///  not smaller than the total number of fragments.
    pub fn deser(mut buf: &[u8]) -> Result<MessagePacket, ProtocolError> {
        let raw_type = buf.checked_get_u8()?;
        let packet_type = PacketType::try_from(raw_type)
            .map_err(|_| ProtocolError::UnknownPacketType(raw_type))?;
        let group = buf.checked_get_string()?;
        let sender = MemberId::from_u128(buf.checked_get_u128()?);
        let message_id = MessageId::from_u128(buf.checked_get_u128()?);
        let sequence = buf.checked_get_u32()?;
        let total = buf.checked_get_u32()?;
        if sequence >= total {
            return Err(ProtocolError::InvalidSequence { sequence, total });
        }
        let payload = buf.checked_get_payload()?;
        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }

        Ok(MessagePacket {
            packet_type,
            group,
            sender,
            message_id,
            sequence,
            total,
            payload,
        })
    }

    /// The net time carried by a TIME_SYNC packet
    pub fn time_sync_net_millis(&self) -> Option<i64> {
        if self.packet_type != PacketType::TimeSync {
            return None;
        }
        let mut payload = self.payload.as_ref();
        match payload.checked_get_i64() {
            Ok(millis) if !payload.has_remaining() => Some(millis),
            _ => None,
        }
    }
}
