use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::data_receiver::PacketListener;
use crate::membership::member_registry::MemberRegistry;
use crate::protocol::packet::MessagePacket;
use crate::util::clock::LocalClock;


/// A group's logical clock: local time plus an offset that is adopted from the group's time
///  master.
///
/// NB: The offset is replaced by every accepted TIME_SYNC without any filtering or compensation
///  for network latency, so net time is only as accurate as the LAN's latency. Conversions
///  between local and net time are exact inverses as long as the offset does not change.
pub struct NetTime {
    clock: Arc<dyn LocalClock>,
    offset_millis: AtomicI64,
}

impl NetTime {
    pub fn new(clock: Arc<dyn LocalClock>) -> NetTime {
        NetTime {
            clock,
            offset_millis: AtomicI64::new(0),
        }
    }

    pub fn local_now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn now(&self) -> i64 {
        self.to_net(self.local_now())
    }

    pub fn offset(&self) -> i64 {
        self.offset_millis.load(Ordering::Acquire)
    }

    pub fn to_net(&self, local_millis: i64) -> i64 {
        local_millis.wrapping_add(self.offset())
    }

    pub fn to_local(&self, net_millis: i64) -> i64 {
        net_millis.wrapping_sub(self.offset())
    }

    /// Adopts an observed net time as 'now'
    pub fn update(&self, observed_net_millis: i64) {
        let offset = observed_net_millis.wrapping_sub(self.local_now());
        let prev = self.offset_millis.swap(offset, Ordering::AcqRel);
        if prev != offset {
            debug!("net time offset changed from {} to {} ms", prev, offset);
        }
    }

    /// A snapshot of 'now' in both net and local time
    pub fn timestamp_now(&self) -> NetTimestamp {
        self.timestamp_from_local(self.local_now())
    }

    pub fn timestamp_from_local(&self, local_millis: i64) -> NetTimestamp {
        NetTimestamp {
            net_millis: self.to_net(local_millis),
            local_millis,
        }
    }

    pub fn timestamp_from_net(&self, net_millis: i64) -> NetTimestamp {
        NetTimestamp {
            net_millis,
            local_millis: self.to_local(net_millis),
        }
    }
}

/// A point in time, expressed both as net time and as this process' local time (both in
///  millis since the epoch). The two values are related by the offset that was valid when the
///  timestamp was created.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NetTimestamp {
    pub net_millis: i64,
    pub local_millis: i64,
}

/// Applies TIME_SYNC packets from the group's time master to the group's [NetTime]
pub struct TimeSyncListener {
    registry: Arc<MemberRegistry>,
    net_time: Arc<NetTime>,
}

impl TimeSyncListener {
    pub fn new(registry: Arc<MemberRegistry>, net_time: Arc<NetTime>) -> TimeSyncListener {
        TimeSyncListener {
            registry,
            net_time,
        }
    }
}

#[async_trait]
impl PacketListener for TimeSyncListener {
    async fn on_packet(&self, packet: &MessagePacket) {
        if self.registry.is_local(packet.sender).await {
            return;
        }
        if !self.registry.is_eligible_time_source(packet.sender).await {
            trace!("ignoring TIME_SYNC from {:?}: not the time master", packet.sender);
            return;
        }

        match packet.time_sync_net_millis() {
            Some(net_millis) => self.net_time.update(net_millis),
            None => warn!("TIME_SYNC from {:?} has an invalid payload - ignoring", packet.sender),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::protocol::ids::MemberId;
    use crate::test_util::clock::ManualClock;
    use crate::test_util::test_config;
    use super::*;

    #[rstest]
    #[case::zero(0, 12345)]
    #[case::positive(1_000_000, 1_700_000_000_000)]
    #[case::negative(-1_000_000, 1_700_000_000_000)]
    #[case::wrapping(i64::MAX, i64::MIN + 5)]
    #[tokio::test(start_paused = true)]
    async fn test_conversion_is_exact_inverse(#[case] observed_offset: i64, #[case] local: i64) {
        let clock = Arc::new(ManualClock::new(1_000));
        let net_time = NetTime::new(clock);
        net_time.update(net_time.local_now().wrapping_add(observed_offset));

        assert_eq!(net_time.offset(), observed_offset);
        assert_eq!(net_time.to_local(net_time.to_net(local)), local);
        assert_eq!(net_time.to_net(net_time.to_local(local)), local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update() {
        let net_time = NetTime::new(Arc::new(ManualClock::new(10_000)));
        assert_eq!(net_time.now(), 10_000);

        net_time.update(25_000);
        assert_eq!(net_time.now(), 25_000);
        assert_eq!(net_time.timestamp_now(), NetTimestamp { net_millis: 25_000, local_millis: 10_000 });
        assert_eq!(net_time.timestamp_from_net(30_000), NetTimestamp { net_millis: 30_000, local_millis: 15_000 });

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(net_time.now(), 25_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_sync_only_from_master() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = Arc::new(MemberRegistry::new("g", &test_config(), clock.clone()));
        let net_time = Arc::new(NetTime::new(clock));
        let listener = TimeSyncListener::new(registry.clone(), net_time.clone());

        registry.add_local_member(MemberId::from_u128(5)).await;
        registry.touch(MemberId::from_u128(3)).await;

        listener.on_packet(&MessagePacket::time_sync("g", MemberId::from_u128(4), 1000)).await;
        assert_eq!(net_time.offset(), 0);

        listener.on_packet(&MessagePacket::time_sync("g", MemberId::from_u128(5), 1000)).await;
        assert_eq!(net_time.offset(), 0);

        listener.on_packet(&MessagePacket::time_sync("g", MemberId::from_u128(3), 1000)).await;
        assert_eq!(net_time.offset(), 1000);

        // a member that is not known yet, but has a smaller id than all known members
        listener.on_packet(&MessagePacket::time_sync("g", MemberId::from_u128(1), 2000)).await;
        assert_eq!(net_time.offset(), 2000);
    }
}
