use crate::protocol::ids::{MemberId, MessageId};


/// Errors reported to application code through the public group API.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("group name {0:?} is reserved for internal use")]
    ReservedGroupName(String),

    /// Some members that were part of the group when the send started did not acknowledge
    ///  all fragments, even after all retries were exhausted.
    #[error("message {message_id} was not acknowledged by {missing:?}")]
    DeliveryFailed {
        message_id: MessageId,
        missing: Vec<MemberId>,
    },

    #[error("message of {size} bytes exceeds the maximum message size of {max} bytes")]
    MessageTooLarge {
        size: usize,
        max: usize,
    },

    #[error("member is closed")]
    MemberClosed,

    /// The process' receive loop stopped after an intensive burst of failures, so no
    ///  acknowledgements can arrive anymore.
    #[error("receive loop is down")]
    ReceiverDown,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Reasons for rejecting a datagram as a group packet. These are expected on a shared multicast
///  segment and are never fatal by themselves.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("packet is truncated")]
    Truncated,

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("group name is not valid UTF-8")]
    InvalidGroupName,

    #[error("sequence number {sequence} is out of range for {total} fragments")]
    InvalidSequence {
        sequence: u32,
        total: u32,
    },

    #[error("{0} trailing bytes after the payload")]
    TrailingBytes(usize),
}
