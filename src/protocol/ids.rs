use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;


macro_rules! uuid_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn random() -> $name {
                $name(Uuid::new_v4())
            }

            pub const fn from_u128(value: u128) -> $name {
                $name(Uuid::from_u128(value))
            }

            pub fn as_u128(&self) -> u128 {
                self.0.as_u128()
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    }
}

uuid_id!(
    /// Identifies a member across all groups. A process that joins the same group twice gets
    ///  two distinct members, and a member id is never reused after the member left.
    ///
    /// Member ids are totally ordered, and the smallest id in a group is the group's time master.
    MemberId
);

uuid_id!(
    /// Identifies a message, shared by all of the message's fragments and their acks
    MessageId
);

impl MessageId {
    /// placeholder for packets that do not belong to a message, e.g. announcements
    pub const NONE: MessageId = MessageId::from_u128(0);
}
