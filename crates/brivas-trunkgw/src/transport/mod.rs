//! Link Layer
//!
//! A span talks to its gateway over two datagram links: `control` for call
//! events and `heartbeat` for liveness and restart coordination. The engine
//! only sees decoded [`ProtocolEvent`]s through the [`Link`] trait.

pub mod memory;
pub mod udp;

pub use memory::{link_pair, GatewayEnd, MemoryConnector, MemoryLink};
pub use udp::{UdpConnector, UdpLink};

use crate::errors::TransportError;
use crate::protocol::ProtocolEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Which of the two links an event travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Control,
    Heartbeat,
}

impl LinkKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// An event queued for sending once locks are released
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub link: LinkKind,
    pub event: ProtocolEvent,
}

impl Outgoing {
    pub fn new(link: LinkKind, event: ProtocolEvent) -> Self {
        Self { link, event }
    }
}

/// Per-link protocol sequence numbers
#[derive(Debug, Default)]
pub struct SequenceCounters {
    tx: AtomicU32,
    rx: AtomicU32,
}

impl SequenceCounters {
    /// Sequence number for the next outgoing event
    pub fn next_tx(&self) -> u32 {
        self.tx.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Track an incoming sequence number, logging gaps
    pub fn observe_rx(&self, link: LinkKind, sequence: u32) {
        let previous = self.rx.swap(sequence, Ordering::Relaxed);
        if previous != 0 && sequence != previous.wrapping_add(1) {
            debug!(link = link.name(), previous, sequence, "Sequence gap");
        }
    }

    pub fn last_tx(&self) -> u32 {
        self.tx.load(Ordering::Relaxed)
    }

    pub fn last_rx(&self) -> u32 {
        self.rx.load(Ordering::Relaxed)
    }
}

/// One datagram link to the gateway
#[async_trait]
pub trait Link: Send + Sync {
    fn kind(&self) -> LinkKind;

    /// Stamp the next sequence number and send
    async fn send(&self, event: &ProtocolEvent) -> Result<(), TransportError>;

    /// Wait for the next event.
    ///
    /// [`TransportError::Codec`] means one malformed datagram was dropped and
    /// the link is still usable; every other error means the link is dead.
    async fn recv(&self) -> Result<ProtocolEvent, TransportError>;

    async fn close(&self) {}
}

/// The two links of a span
pub struct LinkPair {
    pub control: Box<dyn Link>,
    pub heartbeat: Box<dyn Link>,
}

impl LinkPair {
    pub fn get(&self, kind: LinkKind) -> &dyn Link {
        match kind {
            LinkKind::Control => self.control.as_ref(),
            LinkKind::Heartbeat => self.heartbeat.as_ref(),
        }
    }

    pub async fn send(&self, outgoing: &Outgoing) -> Result<(), TransportError> {
        self.get(outgoing.link).send(&outgoing.event).await
    }

    pub async fn close(&self) {
        self.control.close().await;
        self.heartbeat.close().await;
    }
}

/// Opens the link pair for a span; called again after a link failure
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<LinkPair, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_counters() {
        let counters = SequenceCounters::default();
        assert_eq!(counters.next_tx(), 1);
        assert_eq!(counters.next_tx(), 2);
        assert_eq!(counters.last_tx(), 2);

        counters.observe_rx(LinkKind::Control, 5);
        counters.observe_rx(LinkKind::Control, 9);
        assert_eq!(counters.last_rx(), 9);
    }
}
