use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, mpsc};

use crate::frame::Frame;

use super::{EndpointId, InboundMessage, Transport, TransportError};

/// In-process transport pair linking two engine instances.
///
/// Each side presents a configurable origin to the other, so origin-gate
/// behavior is exercised exactly as with real cross-context messaging.
/// `detach` models the peer browsing context going away: posts fail, the
/// liveness probe goes false, and blocked receives wake with an error.
#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    /// Into the peer's queue.
    tx: mpsc::UnboundedSender<InboundMessage>,
    /// Into our own queue; kept for the raw-injection hook.
    self_tx: mpsc::UnboundedSender<InboundMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    local_id: EndpointId,
    peer_id: EndpointId,
    local_origin: String,
    detached: Arc<AtomicBool>,
    detach_signal: Arc<Notify>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Create a linked pair. `origin_a`/`origin_b` are the origins each side
    /// presents to the other.
    pub fn pair(origin_a: &str, origin_b: &str) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let id_a = EndpointId::next();
        let id_b = EndpointId::next();
        let detached = Arc::new(AtomicBool::new(false));
        let detach_signal = Arc::new(Notify::new());

        let a = Self {
            inner: Arc::new(MemInner {
                tx: tx_b.clone(),
                self_tx: tx_a.clone(),
                rx: tokio::sync::Mutex::new(rx_a),
                local_id: id_a,
                peer_id: id_b,
                local_origin: origin_a.to_string(),
                detached: Arc::clone(&detached),
                detach_signal: Arc::clone(&detach_signal),
                closed: AtomicBool::new(false),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: tx_a,
                self_tx: tx_b,
                rx: tokio::sync::Mutex::new(rx_b),
                local_id: id_b,
                peer_id: id_a,
                local_origin: origin_b.to_string(),
                detached,
                detach_signal,
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }

    /// This side's endpoint id (what the peer sees as message source).
    pub fn local_endpoint(&self) -> EndpointId {
        self.inner.local_id
    }

    /// The peer's endpoint id, for building a [`TargetInfo`].
    ///
    /// [`TargetInfo`]: super::TargetInfo
    pub fn peer_endpoint(&self) -> EndpointId {
        self.inner.peer_id
    }

    /// Sever the pair, as if the peer window was closed.
    pub fn detach(&self) {
        self.inner.detached.store(true, Ordering::Release);
        self.inner.detach_signal.notify_waiters();
    }

    /// Push a raw message into this side's inbound queue. Test hook for
    /// forged origins, spoofed endpoints, and malformed wire data.
    pub fn inject(&self, message: InboundMessage) {
        let _ = self.inner.self_tx.send(message);
    }

    fn is_detached(&self) -> bool {
        self.inner.detached.load(Ordering::Acquire)
    }
}

impl Transport for MemTransport {
    fn post(&self, frame: &Frame, _target_origin: &str) -> Result<(), TransportError> {
        if self.is_detached() {
            return Err(TransportError::Detached);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let message = InboundMessage {
            data: frame.to_wire(),
            origin: self.inner.local_origin.clone(),
            source: self.inner.local_id,
        };
        self.inner
            .tx
            .send(message)
            .map_err(|_| TransportError::Detached)
    }

    async fn recv(&self) -> Result<InboundMessage, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        // Register interest before re-checking the flag, so a detach landing
        // in between cannot be missed.
        let detached = self.inner.detach_signal.notified();
        tokio::pin!(detached);
        detached.as_mut().enable();
        if self.is_detached() {
            return Err(TransportError::Detached);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            message = rx.recv() => message.ok_or(TransportError::Closed),
            _ = detached => Err(TransportError::Detached),
        }
    }

    fn is_alive(&self) -> bool {
        !self.is_detached() && !self.inner.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}
