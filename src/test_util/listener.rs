use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};

use crate::messaging::message::{Message, MessageListener};


/// A [MessageListener] that records all messages it receives
#[derive(Default)]
pub struct CollectingMessageListener {
    messages: RwLock<Vec<Arc<Message>>>,
    notify: Notify,
}

impl CollectingMessageListener {
    pub fn new() -> Arc<CollectingMessageListener> {
        Default::default()
    }

    pub async fn messages(&self) -> Vec<Arc<Message>> {
        self.messages.read().await.clone()
    }

    pub async fn payloads(&self) -> Vec<Vec<u8>> {
        self.messages.read().await
            .iter()
            .map(|m| m.payload().to_vec())
            .collect()
    }

    /// Waits until at least `count` messages were received, returning false on timeout
    pub async fn await_count(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.messages.read().await.len() >= count {
                    return;
                }
                notified.await;
            }
        }).await
            .is_ok()
    }
}

#[async_trait]
impl MessageListener for CollectingMessageListener {
    async fn on_message(&self, message: Arc<Message>) {
        self.messages.write().await.push(message);
        self.notify.notify_waiters();
    }
}
