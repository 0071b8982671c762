//! In-process link pair
//!
//! Events still go through the wire codec so both ends see exactly what a
//! UDP peer would.

use super::{Connector, Link, LinkKind, LinkPair, SequenceCounters};
use crate::errors::TransportError;
use crate::protocol::{decode_event, encode_event, ProtocolEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// One end of an in-memory link
pub struct MemoryLink {
    kind: LinkKind,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    sequence: SequenceCounters,
    closed: AtomicBool,
}

impl MemoryLink {
    fn pair(kind: LinkKind) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let end = |tx, rx| Self {
            kind,
            tx,
            rx: Mutex::new(rx),
            sequence: SequenceCounters::default(),
            closed: AtomicBool::new(false),
        };
        (end(a_tx, b_rx), end(b_tx, a_rx))
    }

    /// Next event, or `None` if nothing arrives within `wait`
    pub async fn recv_timeout(&self, wait: Duration) -> Option<ProtocolEvent> {
        tokio::time::timeout(wait, self.recv()).await.ok()?.ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    async fn send(&self, event: &ProtocolEvent) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.kind.name()));
        }
        let mut stamped = event.clone();
        stamped.sequence = self.sequence.next_tx();
        let frame = encode_event(&stamped)?;
        self.tx
            .send(frame.freeze())
            .map_err(|_| TransportError::SendFailed {
                link: self.kind.name(),
                reason: "peer dropped".to_string(),
            })
    }

    async fn recv(&self) -> Result<ProtocolEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        let frame = rx
            .recv()
            .await
            .ok_or(TransportError::Closed(self.kind.name()))?;
        let event = decode_event(&frame)?;
        self.sequence.observe_rx(self.kind, event.sequence);
        Ok(event)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Engine side of [`link_pair`]; hands out its links once
pub struct MemoryConnector {
    links: SyncMutex<Option<LinkPair>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<LinkPair, TransportError> {
        self.links.lock().take().ok_or_else(|| TransportError::Open {
            link: LinkKind::Control.name(),
            reason: "memory links already taken".to_string(),
        })
    }
}

/// Gateway side of [`link_pair`]
pub struct GatewayEnd {
    pub control: MemoryLink,
    pub heartbeat: MemoryLink,
}

impl GatewayEnd {
    pub fn get(&self, kind: LinkKind) -> &MemoryLink {
        match kind {
            LinkKind::Control => &self.control,
            LinkKind::Heartbeat => &self.heartbeat,
        }
    }
}

/// Connected engine and gateway ends
pub fn link_pair() -> (MemoryConnector, GatewayEnd) {
    let (engine_control, gateway_control) = MemoryLink::pair(LinkKind::Control);
    let (engine_heartbeat, gateway_heartbeat) = MemoryLink::pair(LinkKind::Heartbeat);

    let connector = MemoryConnector {
        links: SyncMutex::new(Some(LinkPair {
            control: Box::new(engine_control),
            heartbeat: Box::new(engine_heartbeat),
        })),
    };
    let gateway = GatewayEnd {
        control: gateway_control,
        heartbeat: gateway_heartbeat,
    };
    (connector, gateway)
}
