use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use crate::error::TransportError;
use crate::rate_limiter::RateLimiter;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }
}

/// Called once the datagram was handed to the socket, or with the reason it never will be
pub type SentCallback = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

pub struct OutgoingDatagram {
    pub to: SocketAddr,
    pub buf: Bytes,
    /// higher values are sent first
    pub priority: i32,
    pub on_sent: Option<SentCallback>,
}

impl OutgoingDatagram {
    /// handshake, ACK, termination and keepalive packets go ahead of all payload traffic
    pub const CONTROL_PRIORITY: i32 = i32::MAX;

    pub fn control(to: SocketAddr, buf: Bytes) -> OutgoingDatagram {
        OutgoingDatagram {
            to,
            buf,
            priority: Self::CONTROL_PRIORITY,
            on_sent: None,
        }
    }
}

struct QueuedDatagram {
    seq: u64,
    datagram: OutgoingDatagram,
}

impl QueuedDatagram {
    fn key(&self) -> (i32, std::cmp::Reverse<u64>) {
        (self.datagram.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for QueuedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for QueuedDatagram {}

impl PartialOrd for QueuedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// The single path by which datagrams leave a network interface. All outgoing traffic is queued
///  here, ordered by priority (FIFO for equal priority), and drained by a dedicated task at the
///  pace the [RateLimiter] allows.
///
/// This is a cheap handle: clones share the same queue.
#[derive(Clone)]
pub struct SendPipeline {
    tx: mpsc::UnboundedSender<OutgoingDatagram>,
}

impl SendPipeline {
    pub fn spawn(
        socket: Arc<dyn SendSocket>,
        limiter: RateLimiter,
        shutdown: watch::Receiver<bool>,
    ) -> (SendPipeline, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::send_loop(socket, limiter, rx, shutdown));
        (SendPipeline { tx }, handle)
    }

    /// Adds a datagram to the queue, returning `false` if the pipeline is shut down.
    ///
    /// NB: If the datagram is rejected, its callback is dropped without being called. Callers may
    ///      hold locks that the callback needs, and they handle the rejection themselves.
    #[must_use]
    pub fn enqueue(&self, datagram: OutgoingDatagram) -> bool {
        self.tx.send(datagram).is_ok()
    }

    async fn send_loop(
        socket: Arc<dyn SendSocket>,
        mut limiter: RateLimiter,
        mut rx: mpsc::UnboundedReceiver<OutgoingDatagram>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("starting send pipeline");

        let mut queue: BinaryHeap<QueuedDatagram> = BinaryHeap::new();
        let mut next_seq = 0u64;
        let mut enqueue_closed = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(head) = queue.peek() {
                if !limiter.try_consume(head.datagram.buf.len(), Instant::now()) {
                    break;
                }
                let Some(queued) = queue.pop() else { break };
                let datagram = queued.datagram;

                let result = socket.do_send_packet(datagram.to, &datagram.buf).await
                    .map_err(|e| {
                        debug!("error sending UDP packet to {:?}: {}", datagram.to, e);
                        TransportError::SendFailure(e.to_string())
                    });
                if let Some(on_sent) = datagram.on_sent {
                    on_sent(result);
                }
            }

            if enqueue_closed && queue.is_empty() {
                break;
            }

            let wait = queue.peek()
                .map(|head| limiter.time_until_available(head.datagram.buf.len(), Instant::now()));

            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    break;
                }
                received = rx.recv(), if !enqueue_closed => {
                    match received {
                        Some(datagram) => {
                            Self::push(&mut queue, &mut next_seq, datagram);
                            // pick up everything that is ready so that priorities apply to the whole batch
                            while let Ok(datagram) = rx.try_recv() {
                                Self::push(&mut queue, &mut next_seq, datagram);
                            }
                        }
                        None => enqueue_closed = true,
                    }
                }
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {}
            }
        }

        // callbacks for datagrams that were never sent are failed rather than silently dropped
        rx.close();
        while let Ok(datagram) = rx.try_recv() {
            Self::push(&mut queue, &mut next_seq, datagram);
        }
        if !queue.is_empty() {
            debug!("send pipeline terminating with {} unsent datagrams", queue.len());
        }
        for queued in queue.into_vec() {
            if let Some(on_sent) = queued.datagram.on_sent {
                on_sent(Err(TransportError::Shutdown));
            }
        }
        info!("send pipeline terminated");
    }

    fn push(queue: &mut BinaryHeap<QueuedDatagram>, next_seq: &mut u64, datagram: OutgoingDatagram) {
        trace!("queueing {} bytes for {:?} with priority {}", datagram.buf.len(), datagram.to, datagram.priority);
        queue.push(QueuedDatagram { seq: *next_seq, datagram });
        *next_seq += 1;
    }
}
