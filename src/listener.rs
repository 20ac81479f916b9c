//! Virtual listener: an in-memory accept queue.
//!
//! Hijacked CONNECT streams are pushed in from the dispatcher side and
//! pulled out by the embedded HTTP server's accept loop, which lets that
//! server consume connections that never went through a socket accept.
//! Handoff is rendezvous style: the sender only completes once an accept
//! has actually taken the stream, so producers see backpressure while
//! the server is busy. That matters because queued streams carry live
//! TLS handshakes that would otherwise time out unobserved.

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, ProxyResult};
use crate::net::TunnelStream;

struct Handoff {
    stream: TunnelStream,
    taken: oneshot::Sender<()>,
}

/// Accept half; owned by the embedded server loop.
pub struct VirtualListener {
    rx: Mutex<mpsc::Receiver<Handoff>>,
    closed: CancellationToken,
}

/// Enqueue half; cheap to clone, one per tunnel producer.
#[derive(Clone)]
pub struct TunnelSender {
    tx: mpsc::Sender<Handoff>,
    closed: CancellationToken,
}

/// Creates a connected listener/sender pair.
pub fn virtual_listener() -> (VirtualListener, TunnelSender) {
    let (tx, rx) = mpsc::channel(1);
    let closed = CancellationToken::new();
    (
        VirtualListener {
            rx: Mutex::new(rx),
            closed: closed.clone(),
        },
        TunnelSender { tx, closed },
    )
}

impl VirtualListener {
    /// Waits for the next enqueued stream. Fails with
    /// [`ProxyError::ListenerClosed`] once the listener is closed, even
    /// if streams are still queued.
    pub async fn accept(&self) -> ProxyResult<TunnelStream> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProxyError::ListenerClosed),
            handoff = rx.recv() => match handoff {
                Some(Handoff { stream, taken }) => {
                    let _ = taken.send(());
                    Ok(stream)
                }
                None => Err(ProxyError::ListenerClosed),
            },
        }
    }

    /// Signals close; idempotent. Pending and future accepts and sends
    /// fail from this point on.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Drops any stream that was enqueued but never accepted. Dropping
    /// closes the underlying connection, which releases whatever cleanup
    /// hooks it carries.
    pub(crate) async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {}
    }
}

impl TunnelSender {
    /// Hands a stream to the accept loop. Completes only once an accept
    /// has taken it; fails with [`ProxyError::ListenerClosed`] if the
    /// listener closes first. A stream that was already queued when the
    /// listener closed is dropped (and thereby closed) during shutdown.
    pub async fn send(&self, stream: TunnelStream) -> ProxyResult<()> {
        if self.closed.is_cancelled() {
            return Err(ProxyError::ListenerClosed);
        }
        let (taken_tx, taken_rx) = oneshot::channel();
        let handoff = Handoff {
            stream,
            taken: taken_tx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(ProxyError::ListenerClosed),
            sent = self.tx.send(handoff) => {
                if sent.is_err() {
                    return Err(ProxyError::ListenerClosed);
                }
            }
        }
        tokio::select! {
            biased;
            taken = taken_rx => taken.map(|_| ()).map_err(|_| ProxyError::ListenerClosed),
            _ = self.closed.cancelled() => Err(ProxyError::ListenerClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
