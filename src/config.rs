use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;

use crate::protocol::packet::MessagePacket;


#[derive(Debug, Clone)]
pub struct GroupsConfig {
    /// The multicast group address and port that all packets are sent to. All members of all
    ///  groups of a deployment share this address; groups are distinguished by name inside
    ///  the packets.
    pub multicast_addr: SocketAddr,
    /// The local interface for joining the multicast group, `0.0.0.0` to let the OS decide.
    pub interface: Ipv4Addr,
    /// Multicast TTL - the default of 1 keeps packets on the local network segment
    pub multicast_ttl: u32,

    /// Interval for MEMBER_ANNOUNCE heartbeats and for checking remote members' liveness. Net
    ///  time is synced at the same interval.
    pub announce_interval: Duration,
    /// A member is considered dead if it did not announce itself for
    ///  `announce_interval * member_tolerance_factor`
    pub member_tolerance_factor: u32,

    /// Time to wait for acknowledgements before retransmitting unacknowledged fragments
    pub ack_timeout: Duration,
    /// Number of retransmission rounds after the initial transmission before a send fails
    pub max_retries: u32,

    /// Maximum number of payload bytes per DATA packet. This should be chosen so that a packet
    ///  fits into a single Ethernet frame to avoid IP level fragmentation.
    pub max_fragment_size: usize,
    pub max_message_size: usize,
    /// Size of the receive buffer, i.e. the largest datagram that is accepted
    pub max_datagram_size: usize,

    /// Incomplete messages are discarded after this timeout. Completed messages are remembered
    ///  for the same time so that retransmitted fragments are not delivered twice.
    pub reassembly_staleness_timeout: Duration,
    pub reassembly_sweep_interval: Duration,

    /// Delay after sending MEMBER_LEAVING before a member's resources are released, giving the
    ///  network a chance to deliver the packet
    pub leave_grace_period: Duration,

    /// The receive loop stops if more than this number of failures occur in a row, each within
    ///  `intensive_failure_window` of the previous one.
    pub intensive_failure_threshold: u32,
    pub intensive_failure_window: Duration,
}

impl GroupsConfig {
    pub fn new(multicast_addr: SocketAddr) -> GroupsConfig {
        GroupsConfig {
            multicast_addr,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            announce_interval: Duration::from_secs(1),
            member_tolerance_factor: 3,
            ack_timeout: Duration::from_millis(200),
            max_retries: 5,
            max_fragment_size: 1200,
            max_message_size: 16*1024*1024,
            max_datagram_size: 65507,
            reassembly_staleness_timeout: Duration::from_secs(30),
            reassembly_sweep_interval: Duration::from_secs(1),
            leave_grace_period: Duration::from_millis(50),
            intensive_failure_threshold: 100,
            intensive_failure_window: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.multicast_addr.ip().is_multicast() {
            bail!("{:?} is not a multicast address", self.multicast_addr);
        }
        if self.announce_interval.is_zero() {
            bail!("announce interval must be positive");
        }
        if self.member_tolerance_factor == 0 {
            bail!("member tolerance factor must be at least 1");
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.max_fragment_size == 0 {
            bail!("max fragment size must be positive");
        }
        if self.max_fragment_size > u32::MAX as usize || self.max_message_size > u32::MAX as usize {
            bail!("fragment and message sizes must fit into 32 bits");
        }
        if self.max_fragment_size + MessagePacket::MAX_HEADER_LEN > self.max_datagram_size {
            bail!("a fragment of {} bytes plus packet header does not fit into a datagram of {} bytes", self.max_fragment_size, self.max_datagram_size);
        }
        if self.reassembly_sweep_interval.is_zero() {
            bail!("reassembly sweep interval must be positive");
        }
        if self.reassembly_staleness_timeout <= self.ack_timeout * (self.max_retries + 1) {
            bail!("reassembly staleness timeout must outlast a sender's complete retry cycle");
        }
        if self.intensive_failure_threshold == 0 {
            bail!("intensive failure threshold must be positive");
        }

        Ok(())
    }

    pub fn member_timeout(&self) -> Duration {
        self.announce_interval * self.member_tolerance_factor
    }

    /// The largest fragment count that a valid message can have
    pub fn max_fragments_per_message(&self) -> u32 {
        let max = self.max_message_size.div_ceil(self.max_fragment_size).max(1);
        max.try_into().unwrap_or(u32::MAX)
    }
}
