use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::GroupsConfig;
use crate::data_receiver::DataReceiver;
use crate::error::GroupError;
use crate::group::group::Group;
use crate::group::member::Member;
use crate::protocol::ids::MemberId;
use crate::protocol::packet::MAX_GROUP_NAME_LEN;
use crate::transport::multicast::MulticastTransport;
use crate::transport::Transport;
use crate::util::clock::{LocalClock, SystemClock};


/// Group names starting with this prefix are reserved for internal use (e.g. `$netTime`)
pub const RESERVED_GROUP_PREFIX: &str = "$";

pub fn validate_group_name(name: &str) -> Result<(), GroupError> {
    if name.is_empty() {
        return Err(GroupError::Configuration("group name must not be empty".to_string()));
    }
    if name.len() > MAX_GROUP_NAME_LEN {
        return Err(GroupError::Configuration(format!("group name has {} bytes, the maximum is {}", name.len(), MAX_GROUP_NAME_LEN)));
    }
    if name.starts_with(RESERVED_GROUP_PREFIX) {
        return Err(GroupError::ReservedGroupName(name.to_string()));
    }
    Ok(())
}

/// The registry of all groups that this process participates in. It owns the transport and
///  runs the single receive loop, which is shared by all groups.
///
/// NB: Members keep the registry's internals alive, so the receive loop runs until both the
///  [Groups] handle and all members are dropped, or until [Groups::shutdown] is called.
pub struct Groups {
    inner: Arc<GroupsInner>,
}

pub(crate) struct GroupsInner {
    config: Arc<GroupsConfig>,
    transport: Arc<dyn Transport>,
    data_receiver: Arc<DataReceiver>,
    clock: Arc<dyn LocalClock>,
    groups: Mutex<FxHashMap<String, Arc<Group>>>,
    receive_task: JoinHandle<()>,
    is_shut_down: AtomicBool,
}

impl Drop for GroupsInner {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

impl Groups {
    /// Creates a registry on top of a real multicast socket
    pub fn bind(config: GroupsConfig) -> Result<Groups, GroupError> {
        config.validate()
            .map_err(|e| GroupError::Configuration(e.to_string()))?;
        let transport = Arc::new(MulticastTransport::new(&config)?);
        Groups::new(config, transport)
    }

    pub fn new(config: GroupsConfig, transport: Arc<dyn Transport>) -> Result<Groups, GroupError> {
        let clock = Arc::new(SystemClock::new()?);
        Groups::with_clock(config, transport, clock)
    }

    /// NB: This spawns the receive loop, so it must be called from within a tokio runtime
    pub fn with_clock(config: GroupsConfig, transport: Arc<dyn Transport>, clock: Arc<dyn LocalClock>) -> Result<Groups, GroupError> {
        config.validate()
            .map_err(|e| GroupError::Configuration(e.to_string()))?;
        let config = Arc::new(config);

        let data_receiver = Arc::new(DataReceiver::new(&config, transport.clone()));
        let receive_task = tokio::spawn({
            let data_receiver = data_receiver.clone();
            async move {
                if let Err(e) = data_receiver.run().await {
                    debug!("receive loop terminated: {}", e);
                }
            }
        });

        info!("started group communication on {}", transport.description());
        Ok(Groups {
            inner: Arc::new(GroupsInner {
                config,
                transport,
                data_receiver,
                clock,
                groups: Default::default(),
                receive_task,
                is_shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Joins a group as a new member, creating the group if this is its first local member
    pub async fn join_group(&self, name: &str) -> Result<Member, GroupError> {
        validate_group_name(name)?;

        let mut groups = self.inner.groups.lock().await;
        // checked under the lock so that no join can slip past a concurrent shutdown
        if self.inner.is_receiver_down() {
            return Err(GroupError::ReceiverDown);
        }
        let group = groups.entry(name.to_string())
            .or_insert_with(|| Arc::new(Group::new(
                name,
                self.inner.config.clone(),
                self.inner.transport.clone(),
                self.inner.data_receiver.clone(),
                self.inner.clock.clone(),
            )))
            .clone();

        let member_id = MemberId::random();
        let closed = group.add_local_member(member_id).await;
        drop(groups);

        Ok(Member::new(self.inner.clone(), group, member_id, closed))
    }

    /// Same as [Member::close]
    pub async fn leave_group(&self, member: &Member) {
        member.close().await;
    }

    pub async fn group_names(&self) -> Vec<String> {
        let mut result = self.inner.groups.lock().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// true after the receive loop stopped, either because the transport failed persistently
    ///  or because of [Groups::shutdown]. No groups can be joined and no messages can be sent or
    ///  received after that.
    pub fn is_receiver_down(&self) -> bool {
        self.inner.is_receiver_down()
    }

    /// Closes all local members of all groups and stops the receive loop
    pub async fn shutdown(&self) {
        let groups = {
            let groups = self.inner.groups.lock().await;
            self.inner.is_shut_down.store(true, Ordering::Release);
            groups.values()
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut leaving = Vec::new();
        for group in groups {
            for member_id in group.registry().local_members().await {
                if group.begin_leave(member_id).await {
                    leaving.push((group.clone(), member_id));
                }
            }
        }
        if !leaving.is_empty() {
            tokio::time::sleep(self.inner.config.leave_grace_period).await;
        }
        for (group, member_id) in leaving {
            self.inner.finish_leave(&group, member_id).await;
        }

        self.inner.receive_task.abort();
        info!("group communication shut down");
    }
}

impl GroupsInner {
    pub(crate) async fn leave(&self, group: &Arc<Group>, member_id: MemberId) {
        if !group.begin_leave(member_id).await {
            return;
        }
        tokio::time::sleep(self.config.leave_grace_period).await;
        self.finish_leave(group, member_id).await;
    }

    async fn finish_leave(&self, group: &Arc<Group>, member_id: MemberId) {
        // joining happens under the same lock, so no member can be added to a group that is
        //  being torn down
        let mut groups = self.groups.lock().await;
        if group.finish_leave(member_id).await {
            return;
        }

        if groups.get(group.name()).map(|g| Arc::ptr_eq(g, group)).unwrap_or(false) {
            groups.remove(group.name());
        }
        group.shutdown();
    }

    pub(crate) fn is_receiver_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire) || self.data_receiver.is_down()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::time::{sleep, Instant};
    use crate::membership::member_registry::MemberInfo;
    use crate::membership::membership_events::MembershipEvent;
    use crate::messaging::message::MessageListener;
    use crate::protocol::packet::{MessagePacket, PacketType};
    use crate::test_util::clock::ManualClock;
    use crate::test_util::listener::CollectingMessageListener;
    use crate::test_util::network::{SimulatedNetwork, SimulatedTransport};
    use crate::test_util::test_config;
    use super::*;

    struct Node {
        groups: Groups,
        transport: Arc<SimulatedTransport>,
    }

    fn node(network: &SimulatedNetwork) -> Node {
        node_with_config(network, test_config(), 1_000_000)
    }

    fn node_with_config(network: &SimulatedNetwork, config: GroupsConfig, clock_start_millis: i64) -> Node {
        let transport = network.attach();
        let groups = Groups::with_clock(config, transport.clone(), Arc::new(ManualClock::new(clock_start_millis))).unwrap();
        Node { groups, transport }
    }

    /// joins two members on different nodes and waits for them to discover each other
    async fn two_members(network: &SimulatedNetwork) -> (Node, Member, Node, Member) {
        let a = node(network);
        let b = node(network);
        let ma = a.groups.join_group("chat").await.unwrap();
        let mb = b.groups.join_group("chat").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        (a, ma, b, mb)
    }

    fn message(member: &Member, payload: impl Into<Bytes>) -> crate::messaging::message::Message {
        let mut message = member.create_new_message();
        message.set_payload(payload);
        message
    }

    fn is_data_to(d: &crate::test_util::network::SimulatedDelivery, to: &SimulatedTransport, sequence: Option<u32>) -> bool {
        d.to == to.id() && d.packet()
            .map(|p| p.packet_type == PacketType::Data && sequence.map(|s| s == p.sequence).unwrap_or(true))
            .unwrap_or(false)
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::below_fragment_size(15)]
    #[case::fragment_size(16)]
    #[case::above_fragment_size(17)]
    #[case::ten_fragments(160)]
    #[case::many_fragments(10_000)]
    #[tokio::test(start_paused = true)]
    async fn test_delivery(#[case] len: usize) {
        let network = SimulatedNetwork::new();
        let (_a, ma, _b, mb) = two_members(&network).await;

        let listener = CollectingMessageListener::new();
        mb.add_message_listener(listener.clone()).await.unwrap();
        let sender_listener = CollectingMessageListener::new();
        ma.add_message_listener(sender_listener.clone()).await.unwrap();

        let payload = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let msg = message(&ma, payload.clone());
        ma.send_message(&msg).await.unwrap();

        assert!(listener.await_count(1, Duration::from_secs(1)).await);
        let received = listener.messages().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload().as_ref(), payload.as_slice());
        assert_eq!(received[0].sender(), ma.id());
        assert_eq!(received[0].id(), msg.id());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(listener.messages().await.len(), 1);
        assert!(sender_listener.messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_between_local_members() {
        let network = SimulatedNetwork::new();
        let a = node(&network);
        let m1 = a.groups.join_group("chat").await.unwrap();
        let m2 = a.groups.join_group("chat").await.unwrap();

        let listener1 = CollectingMessageListener::new();
        let listener2 = CollectingMessageListener::new();
        m1.add_message_listener(listener1.clone()).await.unwrap();
        m2.add_message_listener(listener2.clone()).await.unwrap();

        m1.send_message(&message(&m1, "hello")).await.unwrap();
        assert!(listener2.await_count(1, Duration::from_secs(1)).await);
        assert_eq!(listener2.payloads().await, vec![b"hello".to_vec()]);
        assert!(listener1.messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_fragment_is_retransmitted() {
        let network = SimulatedNetwork::new();
        let (_a, ma, b, mb) = two_members(&network).await;
        let listener = CollectingMessageListener::new();
        mb.add_message_listener(listener.clone()).await.unwrap();

        let num_dropped = Arc::new(AtomicUsize::new(0));
        let b_transport = b.transport.clone();
        network.set_drop_filter({
            let num_dropped = num_dropped.clone();
            move |d| is_data_to(d, &b_transport, Some(1)) && num_dropped.fetch_add(1, Ordering::SeqCst) < 2
        });

        ma.send_message(&message(&ma, vec![7u8; 40])).await.unwrap();
        assert_eq!(num_dropped.load(Ordering::SeqCst), 3);

        assert!(listener.await_count(1, Duration::from_secs(1)).await);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(listener.payloads().await, vec![vec![7u8; 40]]);

        network.clear_drop_filter();
        ma.send_message(&message(&ma, vec![8u8; 40])).await.unwrap();
        assert!(listener.await_count(2, Duration::from_secs(1)).await);
        assert_eq!(num_dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ack_causes_no_duplicate_delivery() {
        let network = SimulatedNetwork::new();
        let (a, ma, _b, mb) = two_members(&network).await;
        let listener = CollectingMessageListener::new();
        mb.add_message_listener(listener.clone()).await.unwrap();

        let num_dropped = Arc::new(AtomicUsize::new(0));
        let a_transport = a.transport.clone();
        network.set_drop_filter({
            let num_dropped = num_dropped.clone();
            move |d| d.to == a_transport.id()
                && d.packet().map(|p| p.packet_type == PacketType::Ack && p.sequence == 0).unwrap_or(false)
                && num_dropped.fetch_add(1, Ordering::SeqCst) == 0
        });

        ma.send_message(&message(&ma, vec![1u8; 40])).await.unwrap();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(listener.messages().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failed_for_unreachable_member() {
        let network = SimulatedNetwork::new();
        let (_a, ma, b, mb) = two_members(&network).await;
        network.detach(b.transport.id());

        let msg = message(&ma, "anyone there?");
        let start = Instant::now();
        match ma.send_message(&msg).await {
            Err(GroupError::DeliveryFailed { message_id, missing }) => {
                assert_eq!(message_id, msg.id());
                assert_eq!(missing, vec![mb.id()]);
            }
            other => panic!("unexpected result {:?}", other),
        }
        // initial transmission plus three retries
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_succeeds_when_unresponsive_member_expires() {
        let mut config = test_config();
        config.ack_timeout = Duration::from_millis(200);
        config.max_retries = 5;
        config.reassembly_staleness_timeout = Duration::from_secs(5);

        let network = SimulatedNetwork::new();
        let a = node_with_config(&network, config.clone(), 0);
        let b = node_with_config(&network, config, 0);
        let ma = a.groups.join_group("chat").await.unwrap();
        let _mb = b.groups.join_group("chat").await.unwrap();
        sleep(Duration::from_millis(150)).await;

        network.detach(b.transport.id());
        ma.send_message(&message(&ma, "hello")).await.unwrap();
        assert_eq!(ma.get_member_info().await, vec![MemberInfo { member_id: ma.id(), is_local: true, is_alive: true }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_succeeds_when_member_leaves_during_send() {
        let network = SimulatedNetwork::new();
        let (_a, ma, b, mb) = two_members(&network).await;

        let b_transport = b.transport.clone();
        network.set_drop_filter(move |d| is_data_to(d, &b_transport, None));

        let send = tokio::spawn({
            let ma = ma.clone();
            async move {
                let msg = message(&ma, "bye");
                ma.send_message(&msg).await
            }
        });
        sleep(Duration::from_millis(30)).await;
        mb.close().await;

        send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_the_sender_aborts_send() {
        let network = SimulatedNetwork::new();
        let (a, ma, _b, _mb) = two_members(&network).await;

        let a_transport = a.transport.clone();
        network.set_drop_filter(move |d| d.to == a_transport.id() && d.packet().map(|p| p.packet_type == PacketType::Ack).unwrap_or(false));

        let send = tokio::spawn({
            let ma = ma.clone();
            async move {
                let msg = message(&ma, "hello");
                ma.send_message(&msg).await
            }
        });
        sleep(Duration::from_millis(30)).await;
        ma.close().await;

        assert!(matches!(send.await.unwrap(), Err(GroupError::MemberClosed)));
        assert!(ma.is_closed());
        assert!(matches!(ma.send_message(&message(&ma, "again")).await, Err(GroupError::MemberClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_member_fast_path() {
        let network = SimulatedNetwork::new();
        let a = node(&network);
        let observer = network.attach();
        let ma = a.groups.join_group("chat").await.unwrap();

        let start = Instant::now();
        ma.send_message(&message(&ma, vec![0u8; 40])).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        sleep(Duration::from_millis(50)).await;
        let mut num_data = 0;
        while let Ok(Ok(datagram)) = tokio::time::timeout(Duration::from_millis(1), observer.recv()).await {
            if MessagePacket::deser(&datagram).unwrap().packet_type == PacketType::Data {
                num_data += 1;
            }
        }
        assert_eq!(num_data, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_too_large() {
        let network = SimulatedNetwork::new();
        let a = node(&network);
        let ma = a.groups.join_group("chat").await.unwrap();

        let result = ma.send_message(&message(&ma, vec![0u8; 64*1024 + 1])).await;
        assert!(matches!(result, Err(GroupError::MessageTooLarge { size: 65537, max: 65536 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_of_other_member_is_rejected() {
        let network = SimulatedNetwork::new();
        let a = node(&network);
        let m1 = a.groups.join_group("chat").await.unwrap();
        let m2 = a.groups.join_group("chat").await.unwrap();

        let result = m2.send_message(&message(&m1, "x")).await;
        assert!(matches!(result, Err(GroupError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_message_listener() {
        let network = SimulatedNetwork::new();
        let (_a, ma, _b, mb) = two_members(&network).await;

        let collecting = CollectingMessageListener::new();
        let listener: Arc<dyn MessageListener> = collecting.clone();
        mb.add_message_listener(listener.clone()).await.unwrap();

        ma.send_message(&message(&ma, "one")).await.unwrap();
        assert!(collecting.await_count(1, Duration::from_secs(1)).await);

        assert!(mb.remove_message_listener(&listener).await);
        assert!(!mb.remove_message_listener(&listener).await);

        ma.send_message(&message(&ma, "two")).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(collecting.payloads().await, vec![b"one".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_events_and_expiry() {
        let network = SimulatedNetwork::new();
        let a = node(&network);
        let b = node(&network);
        let c = node(&network);
        let ma = a.groups.join_group("chat").await.unwrap();
        let mut events = ma.subscribe_membership_events();

        let mb = b.groups.join_group("chat").await.unwrap();
        let mc = c.groups.join_group("chat").await.unwrap();
        sleep(Duration::from_millis(150)).await;

        let mut expected = vec![ma.id(), mb.id(), mc.id()];
        expected.sort();
        assert_eq!(ma.get_member_info().await.iter().map(|m| m.member_id).collect::<Vec<_>>(), expected);

        mb.close().await;
        network.detach(c.transport.id());
        sleep(Duration::from_millis(500)).await;

        assert_eq!(ma.get_member_info().await, vec![MemberInfo { member_id: ma.id(), is_local: true, is_alive: true }]);
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::MemberJoined(mb.id()));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::MemberJoined(mc.id()));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::MemberLeft(mb.id()));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::MemberExpired(mc.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_net_time_is_synchronized() {
        let network = SimulatedNetwork::new();
        let a = node_with_config(&network, test_config(), 1_000_000);
        let b = node_with_config(&network, test_config(), 5_000_000);
        let ma = a.groups.join_group("chat").await.unwrap();
        let mb = b.groups.join_group("chat").await.unwrap();

        assert_ne!(ma.get_now().net_millis, mb.get_now().net_millis);
        sleep(Duration::from_millis(350)).await;

        let now_a = ma.get_now();
        let now_b = mb.get_now();
        assert_eq!(now_a.net_millis, now_b.net_millis);

        let (master, other) = if ma.id() < mb.id() { (now_a, now_b) } else { (now_b, now_a) };
        assert_eq!(master.net_millis, master.local_millis);
        assert_ne!(other.net_millis, other.local_millis);

        let ts = mb.create_from_local_time(now_b.local_millis);
        assert_eq!(ts, now_b);
        assert_eq!(mb.create_from_net_time(ts.net_millis), ts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_malformed_packets_stops_receiver() {
        let network = SimulatedNetwork::new();
        let a = node(&network);

        for _ in 0..11 {
            network.inject(a.transport.id(), b"garbage");
        }
        sleep(Duration::from_millis(1)).await;

        assert!(a.groups.is_receiver_down());
        assert!(matches!(a.groups.join_group("chat").await, Err(GroupError::ReceiverDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spread_out_malformed_packets_are_tolerated() {
        let network = SimulatedNetwork::new();
        let a = node(&network);

        for _ in 0..50 {
            network.inject(a.transport.id(), b"garbage");
            sleep(Duration::from_millis(20)).await;
        }

        assert!(!a.groups.is_receiver_down());
        assert!(a.groups.join_group("chat").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_is_torn_down_with_last_member() {
        let network = SimulatedNetwork::new();
        let a = node(&network);

        let m1 = a.groups.join_group("chat").await.unwrap();
        let m2 = a.groups.join_group("chat").await.unwrap();
        let _other = a.groups.join_group("other").await.unwrap();
        assert_eq!(a.groups.group_names().await, vec!["chat".to_string(), "other".to_string()]);

        a.groups.leave_group(&m1).await;
        assert_eq!(a.groups.group_names().await, vec!["chat".to_string(), "other".to_string()]);
        m2.close().await;
        m2.close().await;
        assert_eq!(a.groups.group_names().await, vec!["other".to_string()]);

        let m3 = a.groups.join_group("chat").await.unwrap();
        assert_eq!(m3.get_member_info().await, vec![MemberInfo { member_id: m3.id(), is_local: true, is_alive: true }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_members() {
        let network = SimulatedNetwork::new();
        let (a, ma, _b, mb) = two_members(&network).await;

        a.groups.shutdown().await;
        assert!(ma.is_closed());
        assert!(a.groups.group_names().await.is_empty());

        sleep(Duration::from_millis(10)).await;
        assert_eq!(mb.get_member_info().await, vec![MemberInfo { member_id: mb.id(), is_local: true, is_alive: true }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_member_is_not_announced_during_grace_period() {
        let mut config = test_config();
        config.leave_grace_period = Duration::from_millis(150);

        let network = SimulatedNetwork::new();
        let a = node_with_config(&network, config.clone(), 1_000_000);
        let b = node_with_config(&network, config, 1_000_000);
        let ma = a.groups.join_group("chat").await.unwrap();
        let mb = b.groups.join_group("chat").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(mb.get_member_info().await.len(), 2);

        let observer = network.attach();
        // the grace period spans an announce tick
        ma.close().await;

        let mut packets_from_a = Vec::new();
        while let Ok(Ok(datagram)) = tokio::time::timeout(Duration::from_millis(1), observer.recv()).await {
            let packet = MessagePacket::deser(&datagram).unwrap();
            if packet.sender == ma.id() {
                packets_from_a.push(packet.packet_type);
            }
        }
        assert_eq!(packets_from_a, vec![PacketType::MemberLeaving]);

        assert_eq!(mb.get_member_info().await, vec![MemberInfo { member_id: mb.id(), is_local: true, is_alive: true }]);
        let start = Instant::now();
        mb.send_message(&message(&mb, "still there?")).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_after_shutdown_is_rejected() {
        let network = SimulatedNetwork::new();
        let (a, ma, _b, _mb) = two_members(&network).await;

        a.groups.shutdown().await;
        assert!(a.groups.is_receiver_down());
        assert!(matches!(a.groups.join_group("chat").await, Err(GroupError::ReceiverDown)));
        assert!(matches!(ma.send_message(&message(&ma, "late")).await, Err(GroupError::ReceiverDown)));
        assert!(a.groups.group_names().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_clock_jump_expires_and_rediscovers_members() {
        let network = SimulatedNetwork::new();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let a = Groups::with_clock(test_config(), network.attach(), clock.clone()).unwrap();
        let b = node(&network);

        // b's announce ticks fall between a's expiry ticks
        let ma = a.join_group("chat").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        let mb = b.groups.join_group("chat").await.unwrap();
        sleep(Duration::from_millis(120)).await;
        assert_eq!(ma.get_member_info().await.len(), 2);

        let mut events = ma.subscribe_membership_events();
        clock.jump(10_000);
        sleep(Duration::from_millis(130)).await;

        assert_eq!(events.recv().await.unwrap(), MembershipEvent::MemberExpired(mb.id()));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::MemberJoined(mb.id()));
        assert_eq!(ma.get_member_info().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_rejects_invalid_names() {
        let network = SimulatedNetwork::new();
        let a = node(&network);

        assert!(matches!(a.groups.join_group("$netTime").await, Err(GroupError::ReservedGroupName(_))));
        assert!(matches!(a.groups.join_group("").await, Err(GroupError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_rejected() {
        let network = SimulatedNetwork::new();
        let mut config = test_config();
        config.max_fragment_size = 0;

        let result = Groups::with_clock(config, network.attach(), Arc::new(ManualClock::new(0)));
        assert!(matches!(result, Err(GroupError::Configuration(_))));
    }

    #[rstest]
    #[case::simple("chat", true)]
    #[case::unicode("grüße", true)]
    #[case::max_len(&"x".repeat(255), true)]
    #[case::empty("", false)]
    #[case::too_long(&"x".repeat(256), false)]
    #[case::reserved("$netTime", false)]
    fn test_validate_group_name(#[case] name: &str, #[case] is_valid: bool) {
        assert_eq!(validate_group_name(name).is_ok(), is_valid);
    }

    #[test]
    fn test_reserved_name_error() {
        assert!(matches!(validate_group_name("$x"), Err(GroupError::ReservedGroupName(n)) if n == "$x"));
    }
}
