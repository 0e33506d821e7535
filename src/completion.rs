use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use crate::error::TransportError;

pub type CompletionSender = oneshot::Sender<Result<(), TransportError>>;

/// The outcome of an asynchronous transport operation, resolved exactly once. Awaiting it is
///  optional: dropping a completion has no effect on the operation itself.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<Result<(), TransportError>>);

impl Completion {
    pub fn new() -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (tx, Completion(rx))
    }

    /// a completion that is already resolved, for failures detected before anything was started
    pub fn resolved(result: Result<(), TransportError>) -> Completion {
        let (tx, completion) = Completion::new();
        let _ = tx.send(result);
        completion
    }

    /// non-blocking check, `None` while still pending
    pub fn try_result(&mut self) -> Option<Result<(), TransportError>> {
        match self.0.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TransportError::Shutdown)),
        }
    }
}

impl Future for Completion {
    type Output = Result<(), TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped sender means the owning network interface went away
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TransportError::Shutdown)))
    }
}

/// The two completions of a reliable send: `sent` resolves when every segment was handed to the
///  socket for the first time, `received` when every segment was acknowledged by the peer.
///
/// Both fail with the same error if the message can not be delivered.
#[derive(Debug)]
pub struct Delivery {
    pub sent: Completion,
    pub received: Completion,
}

/// Combines the per-datagram outcomes of a payload that was split into several fragments: the
///  combined completion succeeds after all fragments succeeded, and fails with the first failure.
pub struct FragmentTracker {
    remaining: AtomicUsize,
    tx: Mutex<Option<CompletionSender>>,
}

impl FragmentTracker {
    pub fn new(num_fragments: usize, tx: CompletionSender) -> FragmentTracker {
        FragmentTracker {
            remaining: AtomicUsize::new(num_fragments),
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn on_fragment(&self, result: Result<(), TransportError>) {
        match result {
            Ok(()) => {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.resolve(Ok(()));
                }
            }
            Err(e) => self.resolve(Err(e)),
        }
    }

    fn resolve(&self, result: Result<(), TransportError>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}
