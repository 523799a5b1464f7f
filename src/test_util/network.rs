use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::packet::MessagePacket;
use crate::transport::Transport;


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct EndpointId(pub u32);

/// A single datagram on its way from one endpoint to another, passed to drop filters
pub struct SimulatedDelivery<'a> {
    pub from: EndpointId,
    pub to: EndpointId,
    pub datagram: &'a [u8],
}

impl SimulatedDelivery<'_> {
    pub fn packet(&self) -> Option<MessagePacket> {
        MessagePacket::deser(self.datagram).ok()
    }
}

type DropFilter = Box<dyn Fn(&SimulatedDelivery) -> bool + Send>;

struct Endpoint {
    sender: mpsc::UnboundedSender<Bytes>,
    is_attached: bool,
}

#[derive(Default)]
struct NetworkState {
    endpoints: FxHashMap<EndpointId, Endpoint>,
    next_id: u32,
    drop_filter: Option<DropFilter>,
}

/// An in-process multicast segment. Every datagram sent through an attached [SimulatedTransport]
///  is delivered to all attached transports, including the sender, unless the drop filter
///  rejects it.
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new() -> SimulatedNetwork {
        Default::default()
    }

    pub fn attach(&self) -> Arc<SimulatedTransport> {
        let mut state = self.lock();
        let id = EndpointId(state.next_id);
        state.next_id += 1;

        let (sender, receiver) = mpsc::unbounded_channel();
        state.endpoints.insert(id, Endpoint { sender, is_attached: true });

        Arc::new(SimulatedTransport {
            id,
            network: self.clone(),
            receiver: tokio::sync::Mutex::new(receiver),
        })
    }

    /// A detached endpoint neither sends nor receives anything, simulating a crashed process or
    ///  a network partition. Its receive loop blocks rather than failing.
    pub fn detach(&self, id: EndpointId) {
        if let Some(endpoint) = self.lock().endpoints.get_mut(&id) {
            endpoint.is_attached = false;
        }
    }

    pub fn reattach(&self, id: EndpointId) {
        if let Some(endpoint) = self.lock().endpoints.get_mut(&id) {
            endpoint.is_attached = true;
        }
    }

    /// The filter returns `true` for datagrams that should be dropped
    pub fn set_drop_filter(&self, filter: impl Fn(&SimulatedDelivery) -> bool + Send + 'static) {
        self.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.lock().drop_filter = None;
    }

    /// Delivers a raw datagram to a single endpoint, bypassing drop filter and attachment state
    pub fn inject(&self, to: EndpointId, datagram: &[u8]) {
        if let Some(endpoint) = self.lock().endpoints.get(&to) {
            let _ = endpoint.sender.send(Bytes::copy_from_slice(datagram));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        // the lock is never held across a panic-prone section
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn broadcast(&self, from: EndpointId, datagram: &[u8]) {
        let state = self.lock();
        if !state.endpoints.get(&from).map(|e| e.is_attached).unwrap_or(false) {
            trace!("endpoint {:?} is detached - not sending", from);
            return;
        }

        let datagram = Bytes::copy_from_slice(datagram);
        for (&to, endpoint) in &state.endpoints {
            if !endpoint.is_attached {
                continue;
            }
            if let Some(filter) = &state.drop_filter {
                if filter(&SimulatedDelivery { from, to, datagram: &datagram }) {
                    trace!("dropping datagram from {:?} to {:?}", from, to);
                    continue;
                }
            }
            let _ = endpoint.sender.send(datagram.clone());
        }
    }
}

pub struct SimulatedTransport {
    id: EndpointId,
    network: SimulatedNetwork,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl SimulatedTransport {
    pub fn id(&self) -> EndpointId {
        self.id
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.network.broadcast(self.id, datagram);
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<Bytes> {
        let mut receiver = self.receiver.lock().await;
        loop {
            let datagram = receiver.recv().await
                .ok_or_else(|| anyhow!("simulated network was dropped"))?;

            let is_attached = self.network.lock().endpoints.get(&self.id)
                .map(|e| e.is_attached)
                .unwrap_or(false);
            if is_attached {
                return Ok(datagram);
            }
        }
    }

    fn description(&self) -> String {
        format!("simulated endpoint {:?}", self.id)
    }
}
