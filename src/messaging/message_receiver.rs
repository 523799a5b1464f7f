use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::GroupsConfig;
use crate::data_receiver::PacketListener;
use crate::membership::member_registry::MemberRegistry;
use crate::messaging::message::{Message, MessageListener};
use crate::protocol::ids::{MemberId, MessageId};
use crate::protocol::packet::MessagePacket;
use crate::transport::Transport;


type MessageKey = (MemberId, MessageId);

struct PartialMessage {
    fragments: Vec<Option<Bytes>>,
    num_received: u32,
    started: Instant,
}

impl PartialMessage {
    fn new(total: u32, now: Instant) -> PartialMessage {
        PartialMessage {
            fragments: vec![None; total as usize],
            num_received: 0,
            started: now,
        }
    }

    fn total(&self) -> u32 {
        self.fragments.len() as u32
    }

    fn is_complete(&self) -> bool {
        self.num_received == self.total()
    }

    fn add(&mut self, sequence: u32, payload: Bytes) {
        let slot = &mut self.fragments[sequence as usize];
        if slot.is_none() {
            *slot = Some(payload);
            self.num_received += 1;
        }
    }

    fn assemble(self) -> Bytes {
        let len = self.fragments.iter()
            .map(|f| f.as_ref().map(|f| f.len()).unwrap_or(0))
            .sum();
        let mut result = BytesMut::with_capacity(len);
        for fragment in self.fragments.into_iter().flatten() {
            result.extend_from_slice(&fragment);
        }
        result.freeze()
    }
}

#[derive(Default)]
struct ReassemblyState {
    partial: FxHashMap<MessageKey, PartialMessage>,
    /// completion time of recently completed messages, for filtering retransmitted fragments
    completed: FxHashMap<MessageKey, Instant>,
}

/// The application's message listeners of a group's local members
#[derive(Default)]
pub struct LocalMessageListeners {
    listeners: RwLock<FxHashMap<MemberId, Vec<Arc<dyn MessageListener>>>>,
}

impl LocalMessageListeners {
    pub async fn add(&self, member: MemberId, listener: Arc<dyn MessageListener>) {
        self.listeners.write().await
            .entry(member)
            .or_default()
            .push(listener);
    }

    /// returns `true` if the listener was registered for the member
    pub async fn remove(&self, member: MemberId, listener: &Arc<dyn MessageListener>) -> bool {
        let mut listeners = self.listeners.write().await;
        let Some(for_member) = listeners.get_mut(&member) else {
            return false;
        };

        let len_before = for_member.len();
        for_member.retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
        let removed = for_member.len() != len_before;
        if for_member.is_empty() {
            listeners.remove(&member);
        }
        removed
    }

    pub async fn remove_member(&self, member: MemberId) {
        self.listeners.write().await
            .remove(&member);
    }

    /// all listeners of local members other than the message's sender
    async fn recipients(&self, message: &Message) -> Vec<Arc<dyn MessageListener>> {
        self.listeners.read().await
            .iter()
            .filter(|(&member, _)| member != message.sender())
            .flat_map(|(_, l)| l.iter().cloned())
            .collect()
    }
}

/// Delivers completed messages to listeners. This runs in its own task so that listeners can
///  send messages themselves without blocking the receive loop, which must keep processing
///  acks.
pub async fn run_delivery_loop(mut completed: mpsc::UnboundedReceiver<Arc<Message>>, listeners: Arc<LocalMessageListeners>) {
    while let Some(message) = completed.recv().await {
        for listener in listeners.recipients(&message).await {
            listener.on_message(message.clone()).await;
        }
    }
    trace!("delivery loop finished");
}

/// Reassembles incoming DATA packets of a single group, acknowledging every fragment on behalf
///  of all local members.
pub struct MessageReceiver {
    group: String,
    transport: Arc<dyn Transport>,
    registry: Arc<MemberRegistry>,
    max_fragments: u32,
    staleness_timeout: Duration,
    state: Mutex<ReassemblyState>,
    completed_sender: mpsc::UnboundedSender<Arc<Message>>,
}

impl MessageReceiver {
    pub fn new(
        group: &str,
        config: &GroupsConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<MemberRegistry>,
        completed_sender: mpsc::UnboundedSender<Arc<Message>>,
    ) -> MessageReceiver {
        MessageReceiver {
            group: group.to_string(),
            transport,
            registry,
            max_fragments: config.max_fragments_per_message(),
            staleness_timeout: config.reassembly_staleness_timeout,
            state: Default::default(),
            completed_sender,
        }
    }

    /// Discards incomplete messages that did not complete within the staleness timeout, and
    ///  forgets completed messages after the same timeout.
    pub async fn sweep_stale(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        state.partial.retain(|(sender, message_id), partial| {
            let is_fresh = now.saturating_duration_since(partial.started) < self.staleness_timeout;
            if !is_fresh {
                debug!("discarding incomplete message {:?} from {:?}: {} of {} fragments received", message_id, sender, partial.num_received, partial.total());
            }
            is_fresh
        });
        state.completed.retain(|_, completed_at| now.saturating_duration_since(*completed_at) < self.staleness_timeout);
    }

    pub async fn num_incomplete(&self) -> usize {
        self.state.lock().await.partial.len()
    }

    async fn on_fragment(&self, packet: &MessagePacket) -> FragmentOutcome {
        let key = (packet.sender, packet.message_id);
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if state.completed.contains_key(&key) {
            trace!("fragment {} of completed message {:?} - acking again", packet.sequence, packet.message_id);
            return FragmentOutcome::Accepted;
        }

        let partial = state.partial.entry(key)
            .or_insert_with(|| PartialMessage::new(packet.total, now));
        if partial.total() != packet.total {
            warn!("fragment of {:?} claims {} fragments, previous fragments claimed {} - discarding", packet.message_id, packet.total, partial.total());
            return FragmentOutcome::Rejected;
        }

        partial.add(packet.sequence, packet.payload.clone());
        if !partial.is_complete() {
            return FragmentOutcome::Accepted;
        }

        match state.partial.remove(&key) {
            Some(partial) => {
                state.completed.insert(key, now);
                FragmentOutcome::Completed(Message::new(packet.message_id, packet.sender, &self.group, partial.assemble()))
            }
            None => FragmentOutcome::Accepted,
        }
    }
}

enum FragmentOutcome {
    Rejected,
    Accepted,
    Completed(Message),
}

#[async_trait]
impl PacketListener for MessageReceiver {
    async fn on_packet(&self, packet: &MessagePacket) {
        if packet.total > self.max_fragments {
            warn!("message {:?} from {:?} has {} fragments, exceeding the maximum of {} - discarding", packet.message_id, packet.sender, packet.total, self.max_fragments);
            return;
        }

        let recipients = self.registry.local_members().await
            .into_iter()
            .filter(|&m| m != packet.sender)
            .collect::<Vec<_>>();
        if recipients.is_empty() {
            return;
        }

        let completed = match self.on_fragment(packet).await {
            FragmentOutcome::Rejected => return,
            FragmentOutcome::Accepted => None,
            FragmentOutcome::Completed(message) => Some(message),
        };

        for recipient in recipients {
            let ack = MessagePacket::ack(&self.group, recipient, packet.message_id, packet.sequence, packet.total);
            if let Err(e) = self.transport.send(&ack.to_bytes()).await {
                warn!("error sending ack for {:?}: {}", packet.message_id, e);
            }
        }

        if let Some(message) = completed {
            debug!("received {:?}", message);
            if self.completed_sender.send(Arc::new(message)).is_err() {
                debug!("delivery loop is shut down - dropping message");
            }
        }
    }
}
