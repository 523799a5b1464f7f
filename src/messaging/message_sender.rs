use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::config::GroupsConfig;
use crate::data_receiver::{DataReceiver, ListenerKey, PacketListener};
use crate::error::GroupError;
use crate::membership::member_registry::MemberRegistry;
use crate::membership::membership_events::MembershipEvent;
use crate::messaging::ack_table::AckTable;
use crate::messaging::message::Message;
use crate::protocol::packet::MessagePacket;
use crate::transport::Transport;
use crate::util::safe_converter::PrecheckedCast;


/// Splits a payload into fragments of at most `max_fragment_size` bytes. An empty payload is
///  sent as a single empty fragment.
pub fn fragment(payload: &Bytes, max_fragment_size: usize) -> Vec<Bytes> {
    if payload.is_empty() {
        return vec![Bytes::new()];
    }

    (0..payload.len())
        .step_by(max_fragment_size)
        .map(|start| payload.slice(start..payload.len().min(start + max_fragment_size)))
        .collect()
}

/// Receives the ACK packets for a single outgoing message
struct AckListener {
    table: Mutex<AckTable>,
    notify: Notify,
}

#[async_trait]
impl PacketListener for AckListener {
    async fn on_packet(&self, packet: &MessagePacket) {
        let mut table = self.table.lock().await;
        if packet.total != table.total() {
            debug!("ACK from {:?} for {} fragments, message has {} - ignoring", packet.sender, packet.total, table.total());
            return;
        }
        if table.acknowledge(packet.sender, packet.sequence) {
            trace!("fragment {} acknowledged by {:?}", packet.sequence, packet.sender);
            self.notify.notify_one();
        }
    }
}

/// Sends messages of a single group reliably: a send completes successfully only after every
///  member of the group (as of the start of the send) acknowledged every fragment.
pub struct MessageSender {
    group: String,
    config: Arc<GroupsConfig>,
    transport: Arc<dyn Transport>,
    data_receiver: Arc<DataReceiver>,
    registry: Arc<MemberRegistry>,
}

impl MessageSender {
    pub fn new(group: &str, config: Arc<GroupsConfig>, transport: Arc<dyn Transport>, data_receiver: Arc<DataReceiver>, registry: Arc<MemberRegistry>) -> MessageSender {
        MessageSender {
            group: group.to_string(),
            config,
            transport,
            data_receiver,
            registry,
        }
    }

    /// `closed` is the sending member's closed flag: closing the member aborts the send.
    pub async fn send(&self, message: &Message, mut closed: watch::Receiver<bool>) -> Result<(), GroupError> {
        if *closed.borrow() {
            return Err(GroupError::MemberClosed);
        }
        if self.data_receiver.is_down() {
            return Err(GroupError::ReceiverDown);
        }
        if message.payload().len() > self.config.max_message_size {
            return Err(GroupError::MessageTooLarge {
                size: message.payload().len(),
                max: self.config.max_message_size,
            });
        }

        let fragments = fragment(message.payload(), self.config.max_fragment_size);
        let total: u32 = fragments.len().prechecked_cast();
        let packets = fragments.into_iter()
            .enumerate()
            .map(|(sequence, payload)| MessagePacket::data(&self.group, message.sender(), message.id(), sequence.prechecked_cast(), total, payload).to_bytes())
            .collect::<Vec<_>>();

        let members = self.registry.snapshot_excluding(message.sender()).await;
        if members.is_empty() {
            trace!("no other members in group {:?} - sending {:?} without waiting for acks", self.group, message.id());
            for packet in &packets {
                self.transport.send(packet).await?;
            }
            return Ok(());
        }

        debug!("sending {:?} in {} fragments to {} members", message, total, members.len());

        let ack_listener = Arc::new(AckListener {
            table: Mutex::new(AckTable::new(&members, total)),
            notify: Notify::new(),
        });
        let key = ListenerKey::Ack { group: self.group.clone(), message_id: message.id() };
        // registered before the first transmission so that no ack can be missed
        let listener_id = self.data_receiver.register(key.clone(), ack_listener.clone());

        let result = self.transmit_until_acked(message, &packets, &ack_listener, &mut closed).await;

        self.data_receiver.deregister(&key, listener_id);
        result
    }

    async fn transmit_until_acked(&self, message: &Message, packets: &[Bytes], ack_listener: &AckListener, closed: &mut watch::Receiver<bool>) -> Result<(), GroupError> {
        let mut membership_events = self.registry.subscribe();

        for round in 0..=self.config.max_retries {
            self.prune_departed_members(ack_listener).await;

            let unacked = ack_listener.table.lock().await.unacked_sequences();
            if unacked.is_empty() {
                return Ok(());
            }
            if round > 0 {
                debug!("retransmitting {} fragments of {:?} (round {})", unacked.iter().count(), message.id(), round);
            }
            for sequence in unacked.iter() {
                self.transport.send(&packets[sequence]).await?;
            }

            let deadline = Instant::now() + self.config.ack_timeout;
            loop {
                if ack_listener.table.lock().await.is_complete() {
                    return Ok(());
                }
                if self.data_receiver.is_down() {
                    return Err(GroupError::ReceiverDown);
                }

                select! {
                    _ = ack_listener.notify.notified() => {}
                    _ = sleep_until(deadline) => break,
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            debug!("sending member was closed - aborting send of {:?}", message.id());
                            return Err(GroupError::MemberClosed);
                        }
                    }
                    evt = membership_events.recv() => {
                        if !matches!(evt, Ok(MembershipEvent::MemberJoined(_))) {
                            self.prune_departed_members(ack_listener).await;
                        }
                    }
                }
            }
        }

        self.prune_departed_members(ack_listener).await;
        let table = ack_listener.table.lock().await;
        if table.is_complete() {
            return Ok(());
        }
        let missing = table.missing_members();
        debug!("giving up on {:?}: no complete acks from {:?}", message.id(), missing);
        Err(GroupError::DeliveryFailed {
            message_id: message.id(),
            missing,
        })
    }

    /// Members that left or expired while the send is in progress are not waited for
    async fn prune_departed_members(&self, ack_listener: &AckListener) {
        let mut table = ack_listener.table.lock().await;
        for member in table.members() {
            if !self.registry.contains(member).await {
                debug!("member {:?} left the group - not waiting for its acks", member);
                table.retain_members(|m| m != member);
            }
        }
    }
}
