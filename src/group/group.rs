use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::GroupsConfig;
use crate::data_receiver::{DataReceiver, ListenerId, ListenerKey, PacketListener};
use crate::error::GroupError;
use crate::membership::announce::MembershipListener;
use crate::membership::member_registry::MemberRegistry;
use crate::messaging::message::{Message, MessageListener};
use crate::messaging::message_receiver::{run_delivery_loop, LocalMessageListeners, MessageReceiver};
use crate::messaging::message_sender::MessageSender;
use crate::net_time::{NetTime, TimeSyncListener};
use crate::protocol::ids::MemberId;
use crate::protocol::packet::MessagePacket;
use crate::transport::Transport;
use crate::util::clock::LocalClock;


/// The per-process state of a single group: its members, its net time, and the machinery for
///  sending and receiving messages. A group exists as long as it has at least one local member.
/// The 'closed' flags of local members that are not (yet) leaving
type Closers = Mutex<FxHashMap<MemberId, watch::Sender<bool>>>;

pub struct Group {
    name: String,
    transport: Arc<dyn Transport>,
    data_receiver: Arc<DataReceiver>,
    registry: Arc<MemberRegistry>,
    net_time: Arc<NetTime>,
    sender: MessageSender,
    message_listeners: Arc<LocalMessageListeners>,
    packet_listeners: Vec<(ListenerKey, ListenerId)>,
    closers: Arc<Closers>,
    tasks: Vec<JoinHandle<()>>,
    is_shut_down: AtomicBool,
}

impl Group {
    pub fn new(name: &str, config: Arc<GroupsConfig>, transport: Arc<dyn Transport>, data_receiver: Arc<DataReceiver>, clock: Arc<dyn LocalClock>) -> Group {
        debug!("creating group {:?}", name);

        let registry = Arc::new(MemberRegistry::new(name, &config, clock.clone()));
        let net_time = Arc::new(NetTime::new(clock));
        let message_listeners = Arc::new(LocalMessageListeners::default());
        let closers: Arc<Closers> = Default::default();

        let (completed_sender, completed_receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(MessageReceiver::new(name, &config, transport.clone(), registry.clone(), completed_sender));

        let data_listener: Arc<dyn PacketListener> = receiver.clone();
        let membership_listener: Arc<dyn PacketListener> = Arc::new(MembershipListener::new(registry.clone()));
        let time_sync_listener: Arc<dyn PacketListener> = Arc::new(TimeSyncListener::new(registry.clone(), net_time.clone()));

        let packet_listeners = [
            (ListenerKey::Data { group: name.to_string() }, data_listener),
            (ListenerKey::Membership { group: name.to_string() }, membership_listener),
            (ListenerKey::TimeSync { group: name.to_string() }, time_sync_listener),
        ].into_iter()
            .map(|(key, listener)| {
                let id = data_receiver.register(key.clone(), listener);
                (key, id)
            })
            .collect();

        let tasks = vec![
            tokio::spawn(run_ticker(name.to_string(), config.clone(), transport.clone(), registry.clone(), net_time.clone(), closers.clone())),
            tokio::spawn(run_sweeper(config.clone(), receiver)),
            tokio::spawn(run_delivery_loop(completed_receiver, message_listeners.clone())),
        ];

        Group {
            name: name.to_string(),
            sender: MessageSender::new(name, config, transport.clone(), data_receiver.clone(), registry.clone()),
            transport,
            data_receiver,
            registry,
            net_time,
            message_listeners,
            packet_listeners,
            closers,
            tasks,
            is_shut_down: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn net_time(&self) -> &NetTime {
        &self.net_time
    }

    /// Adds a local member, returning a receiver for the member's 'closed' flag
    pub async fn add_local_member(&self, member_id: MemberId) -> watch::Receiver<bool> {
        let (closer, closed) = watch::channel(false);
        self.closers.lock().await
            .insert(member_id, closer);
        self.registry.add_local_member(member_id).await;

        // announce right away rather than waiting for the next tick to speed up discovery
        self.send_packet(MessagePacket::announce(&self.name, member_id)).await;
        closed
    }

    pub async fn add_message_listener(&self, member_id: MemberId, listener: Arc<dyn MessageListener>) {
        self.message_listeners.add(member_id, listener).await;
    }

    pub async fn remove_message_listener(&self, member_id: MemberId, listener: &Arc<dyn MessageListener>) -> bool {
        self.message_listeners.remove(member_id, listener).await
    }

    pub async fn send(&self, message: &Message, closed: watch::Receiver<bool>) -> Result<(), GroupError> {
        self.sender.send(message, closed).await
    }

    /// The first step of leaving: marks the member as closed and sends MEMBER_LEAVING. Returns
    ///  `false` if the member was closed before.
    ///
    /// NB: The member is not announced from here on. MEMBER_LEAVING is sent while holding the
    ///  closers' lock, so no announce for the member can follow it on the wire.
    pub async fn begin_leave(&self, member_id: MemberId) -> bool {
        let mut closers = self.closers.lock().await;
        let Some(closer) = closers.remove(&member_id) else {
            return false;
        };
        let _ = closer.send(true);

        self.send_packet(MessagePacket::leaving(&self.name, member_id)).await;
        true
    }

    /// The second step of leaving, after the grace period: removes the member and its
    ///  listeners. Returns `true` if there are local members left in the group.
    pub async fn finish_leave(&self, member_id: MemberId) -> bool {
        self.message_listeners.remove_member(member_id).await;
        self.registry.remove_member(member_id).await;
        !self.registry.local_members().await.is_empty()
    }

    async fn send_packet(&self, packet: MessagePacket) {
        if let Err(e) = self.transport.send(&packet.to_bytes()).await {
            warn!("error sending {:?} for group {:?}: {}", packet.packet_type, self.name, e);
        }
    }

    /// Stops the group's background tasks and deregisters it from the receive loop
    pub fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down group {:?}", self.name);

        for task in &self.tasks {
            task.abort();
        }
        for (key, id) in &self.packet_listeners {
            self.data_receiver.deregister(key, *id);
        }
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Periodic group housekeeping: local members announce themselves, silent members expire, and
///  if a local member is the time master, it distributes its net time. Members that are
///  leaving are neither announced nor act as time master.
async fn run_ticker(name: String, config: Arc<GroupsConfig>, transport: Arc<dyn Transport>, registry: Arc<MemberRegistry>, net_time: Arc<NetTime>, closers: Arc<Closers>) {
    let mut ticks = interval(config.announce_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        registry.expire_stale().await;

        // held until the packets are sent, see Group::begin_leave
        let active = closers.lock().await;
        let mut packets = active.keys()
            .map(|&member_id| MessagePacket::announce(&name, member_id))
            .collect::<Vec<_>>();

        if let Some(master) = registry.time_master().await {
            if active.contains_key(&master) {
                packets.push(MessagePacket::time_sync(&name, master, net_time.now()));
            }
        }

        for packet in packets {
            if let Err(e) = transport.send(&packet.to_bytes()).await {
                warn!("error sending {:?} for group {:?}: {}", packet.packet_type, name, e);
            }
        }
    }
}

async fn run_sweeper(config: Arc<GroupsConfig>, receiver: Arc<MessageReceiver>) {
    let mut ticks = interval(config.reassembly_sweep_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        receiver.sweep_stale().await;
    }
}
