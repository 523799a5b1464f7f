//! Reliable group communication on top of LAN multicast.
//!
//! Processes join named groups and exchange binary messages with the other members of a group.
//!  A successful send means that every member that was part of the group when the send started
//!  received the complete message. Members announce themselves periodically, and members that
//!  stop announcing are expired. Each group additionally maintains a shared 'net time' so that
//!  members with unaligned system clocks can agree on timestamps.
//!
//! The entry point is [group::groups::Groups], which owns the transport and the single receive
//!  loop of the process.

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod data_receiver;
pub mod membership;
pub mod net_time;
pub mod messaging;
pub mod group;
pub mod util;
pub mod test_util;
