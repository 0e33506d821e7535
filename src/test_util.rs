//! Utilities for unit tests that exercise connections without a real socket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use crate::config::TransportConfig;
use crate::connection::InterfaceContext;
use crate::identity::Identity;
use crate::listener::ListenerRegistry;
use crate::packet::Packet;
use crate::rate_limiter::RateLimiter;
use crate::send_pipeline::{SendPipeline, SendSocket};

/// Records decoded packets instead of sending them
#[derive(Default)]
pub struct TrackingSendSocket {
    tracker: Mutex<Vec<(SocketAddr, Packet)>>,
}

impl TrackingSendSocket {
    /// returns sent packets, clearing the internal buffer
    pub fn sent_packets(&self) -> Vec<(SocketAddr, Packet)> {
        std::mem::take(&mut *self.tracker.lock())
    }
}

#[async_trait]
impl SendSocket for TrackingSendSocket {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        let packet = Packet::deser(Bytes::copy_from_slice(packet_buf))
            .expect("sent packets should be well-formed");
        self.tracker.lock().push((to, packet));
        Ok(())
    }
}

/// A context with a fresh identity, and a send pipeline writing to a [TrackingSendSocket]. The
///  pipeline runs until the returned sender is dropped.
pub fn test_context(config: TransportConfig) -> (Arc<InterfaceContext>, Arc<TrackingSendSocket>, watch::Sender<bool>) {
    let socket = Arc::new(TrackingSendSocket::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let limiter = RateLimiter::new(config.max_upstream_bytes_per_second, config.effective_datagram_size(), Instant::now());
    let (pipeline, _handle) = SendPipeline::spawn(socket.clone(), limiter, shutdown_rx);

    let ctx = Arc::new(InterfaceContext {
        config: Arc::new(config),
        identity: Arc::new(Identity::generate().expect("key generation should work")),
        pipeline,
        listeners: ListenerRegistry::default(),
    });
    (ctx, socket, shutdown_tx)
}

/// gives spawned tasks (send pipeline, listeners) the chance to run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
