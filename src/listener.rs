use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;
use crate::peer_addr::PeerAddress;

/// Application callback for received payloads. It is called on a task of its own, so it may
///  take its time without holding up packet processing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, sender: PeerAddress, payload: Bytes);
}

/// Forwards messages into a channel, which is often the most convenient way for application code
///  to consume them
#[async_trait]
impl MessageListener for mpsc::UnboundedSender<(PeerAddress, Bytes)> {
    async fn on_message(&self, sender: PeerAddress, payload: Bytes) {
        if self.send((sender, payload)).is_err() {
            trace!("message listener channel is closed - discarding message from {:?}", sender);
        }
    }
}

pub fn dispatch_to(listener: &Arc<dyn MessageListener>, sender: PeerAddress, payload: Bytes) {
    let listener = listener.clone();
    tokio::spawn(async move {
        listener.on_message(sender, payload).await;
    });
}

/// Interface-wide listeners: they receive unreliable messages, and reliable messages from
///  connections that have no listener of their own
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
}

impl ListenerRegistry {
    pub fn register(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().push(listener);
    }

    pub fn dispatch(&self, sender: PeerAddress, payload: Bytes) {
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            trace!("no listener registered - discarding message from {:?}", sender);
        }
        for listener in listeners.iter() {
            dispatch_to(listener, sender, payload.clone());
        }
    }
}
