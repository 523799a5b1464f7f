pub mod failure_guard;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;
use arc_swap::ArcSwap;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::GroupsConfig;
use crate::data_receiver::failure_guard::{FailureVerdict, IntensiveFailureGuard};
use crate::protocol::ids::MessageId;
use crate::protocol::packet::{MessagePacket, PacketType};
use crate::transport::Transport;


/// Packets are routed to listeners based on packet type and group, and for ACKs additionally
///  on the message they acknowledge.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ListenerKey {
    Data { group: String },
    Ack { group: String, message_id: MessageId },
    /// MEMBER_ANNOUNCE and MEMBER_LEAVING
    Membership { group: String },
    TimeSync { group: String },
}

impl ListenerKey {
    pub fn for_packet(packet: &MessagePacket) -> ListenerKey {
        let group = packet.group.clone();
        match packet.packet_type {
            PacketType::Data => ListenerKey::Data { group },
            PacketType::Ack => ListenerKey::Ack { group, message_id: packet.message_id },
            PacketType::MemberAnnounce | PacketType::MemberLeaving => ListenerKey::Membership { group },
            PacketType::TimeSync => ListenerKey::TimeSync { group },
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(u64);

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketListener: Send + Sync + 'static {
    /// Called from the receive loop, so implementations must not wait for other packets
    async fn on_packet(&self, packet: &MessagePacket);
}

type ListenerTable = FxHashMap<ListenerKey, Vec<(ListenerId, Arc<dyn PacketListener>)>>;

/// The [DataReceiver] runs the process' single receive loop: it reads datagrams from the
///  [Transport], decodes them, and dispatches them to the registered listeners.
///
/// The listener table is replaced as a whole on every registration change so that the receive
///  loop reads it without taking a lock.
pub struct DataReceiver {
    transport: Arc<dyn Transport>,
    listeners: ArcSwap<ListenerTable>,
    next_listener_id: AtomicU64,
    is_down: AtomicBool,
    failure_threshold: u32,
    failure_window: std::time::Duration,
}

impl DataReceiver {
    pub fn new(config: &GroupsConfig, transport: Arc<dyn Transport>) -> DataReceiver {
        DataReceiver {
            transport,
            listeners: Default::default(),
            next_listener_id: AtomicU64::new(1),
            is_down: AtomicBool::new(false),
            failure_threshold: config.intensive_failure_threshold,
            failure_window: config.intensive_failure_window,
        }
    }

    pub fn register(&self, key: ListenerKey, listener: Arc<dyn PacketListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        trace!("registering listener {:?} for {:?}", id, key);

        self.listeners.rcu(|current| {
            let mut updated = ListenerTable::clone(current);
            updated.entry(key.clone())
                .or_default()
                .push((id, listener.clone()));
            updated
        });
        id
    }

    pub fn deregister(&self, key: &ListenerKey, id: ListenerId) {
        trace!("deregistering listener {:?} for {:?}", id, key);

        self.listeners.rcu(|current| {
            let mut updated = ListenerTable::clone(current);
            if let Some(listeners) = updated.get_mut(key) {
                listeners.retain(|(candidate, _)| *candidate != id);
                if listeners.is_empty() {
                    updated.remove(key);
                }
            }
            updated
        });
    }

    pub fn num_listeners(&self, key: &ListenerKey) -> usize {
        self.listeners.load()
            .get(key)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// true after the receive loop stopped because of an intensive burst of failures
    pub fn is_down(&self) -> bool {
        self.is_down.load(Ordering::Acquire)
    }

    /// Runs the receive loop. This returns only if the intensive failure guard decides that
    ///  the transport is broken, so it is typically cancelled by aborting the task that runs it.
    pub async fn run(&self) -> anyhow::Result<()> {
        debug!("starting receive loop on {}", self.transport.description());
        let mut failure_guard = IntensiveFailureGuard::new(self.failure_threshold, self.failure_window);

        loop {
            let failure = match self.transport.recv().await {
                Ok(datagram) => match MessagePacket::deser(&datagram) {
                    Ok(packet) => {
                        failure_guard.on_success();
                        self.dispatch(packet).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("discarding invalid datagram of {} bytes: {}", datagram.len(), e);
                        anyhow::Error::from(e)
                    }
                },
                Err(e) => {
                    warn!("error receiving datagram: {}", e);
                    e
                }
            };

            if failure_guard.on_failure(Instant::now()) == FailureVerdict::Fatal {
                error!("{} failures in rapid succession, last one: {} - stopping the receive loop", failure_guard.streak(), failure);
                self.is_down.store(true, Ordering::Release);
                bail!("receive loop stopped after intensive failure: {}", failure);
            }
        }
    }

    async fn dispatch(&self, packet: MessagePacket) {
        let key = ListenerKey::for_packet(&packet);
        trace!("received {:?} packet for {:?} from {:?}", packet.packet_type, key, packet.sender);

        let listeners = self.listeners.load_full();
        match listeners.get(&key) {
            Some(listeners) => {
                for (_, listener) in listeners {
                    listener.on_packet(&packet).await;
                }
            }
            None => {
                trace!("no listener for {:?} - ignoring packet", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use anyhow::anyhow;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use crate::protocol::ids::MemberId;
    use crate::test_util::network::SimulatedNetwork;
    use crate::test_util::test_config;
    use crate::transport::MockTransport;
    use super::*;

    fn announce(group: &str, sender: u128) -> MessagePacket {
        MessagePacket::announce(group, MemberId::from_u128(sender))
    }

    fn listener_expecting(packet: MessagePacket, times: usize) -> Arc<dyn PacketListener> {
        let mut listener = MockPacketListener::new();
        listener.expect_on_packet()
            .with(eq(packet))
            .times(times)
            .return_const(());
        Arc::new(listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_by_key() {
        let network = SimulatedNetwork::new();
        let transport = network.attach();
        let receiver = Arc::new(DataReceiver::new(&test_config(), transport.clone()));

        let a1 = announce("a", 1);
        let b1 = announce("b", 1);

        receiver.register(ListenerKey::Membership { group: "a".to_string() }, listener_expecting(a1.clone(), 1));
        receiver.register(ListenerKey::Membership { group: "a".to_string() }, listener_expecting(a1.clone(), 1));
        receiver.register(ListenerKey::Data { group: "a".to_string() }, Arc::new(MockPacketListener::new()));

        let receive_task = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.run().await }
        });

        transport.send(&a1.to_bytes()).await.unwrap();
        transport.send(&b1.to_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        receive_task.abort();
        assert!(!receiver.is_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister() {
        let network = SimulatedNetwork::new();
        let transport = network.attach();
        let receiver = Arc::new(DataReceiver::new(&test_config(), transport.clone()));

        let key = ListenerKey::Membership { group: "a".to_string() };
        let id = receiver.register(key.clone(), listener_expecting(announce("a", 1), 0));
        let kept = receiver.register(key.clone(), listener_expecting(announce("a", 1), 1));
        assert_eq!(receiver.num_listeners(&key), 2);

        receiver.deregister(&key, id);
        assert_eq!(receiver.num_listeners(&key), 1);

        let receive_task = tokio::spawn({
            let receiver = receiver.clone();
            async move { receiver.run().await }
        });
        transport.send(&announce("a", 1).to_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        receive_task.abort();

        receiver.deregister(&key, kept);
        assert_eq!(receiver.num_listeners(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_transport_errors_is_fatal() {
        let mut config = test_config();
        config.intensive_failure_threshold = 3;

        let mut transport = MockTransport::new();
        transport.expect_description().return_const("mock".to_string());
        transport.expect_recv()
            .times(4)
            .returning(|| Err(anyhow!("socket is broken")));

        let receiver = DataReceiver::new(&config, Arc::new(transport));
        assert!(receiver.run().await.is_err());
        assert!(receiver.is_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_datagram_resets_failure_streak() {
        let mut config = test_config();
        config.intensive_failure_threshold = 3;

        let counter = Arc::new(AtomicUsize::new(0));
        let mut transport = MockTransport::new();
        transport.expect_description().return_const("mock".to_string());
        transport.expect_recv()
            .returning({
                let counter = counter.clone();
                move || {
                    // three garbage datagrams followed by a valid one, repeated; then a fatal burst
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 40 && n % 4 == 3 {
                        Ok(announce("a", 1).to_bytes())
                    }
                    else {
                        Ok(Bytes::from_static(b"garbage"))
                    }
                }
            });

        let receiver = DataReceiver::new(&config, Arc::new(transport));
        assert!(receiver.run().await.is_err());
        assert!(receiver.is_down());
        // the loop survives all ten bursts of three, and stops at the fourth failure after that
        assert_eq!(counter.load(Ordering::SeqCst), 44);
    }
}
