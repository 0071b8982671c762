//! UDP links

use super::{Connector, Link, LinkKind, LinkPair, SequenceCounters};
use crate::config::LinkConfig;
use crate::errors::TransportError;
use crate::protocol::{decode_event, encode_event, ProtocolEvent};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, instrument, warn};

const MAX_DATAGRAM: usize = 1500;

/// A connected UDP socket carrying one link
pub struct UdpLink {
    kind: LinkKind,
    socket: UdpSocket,
    remote: SocketAddr,
    sequence: SequenceCounters,
}

impl UdpLink {
    #[instrument(skip_all, fields(link = kind.name(), %local, %remote))]
    pub async fn bind(
        kind: LinkKind,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await.map_err(|e| TransportError::Open {
            link: kind.name(),
            reason: e.to_string(),
        })?;
        socket.connect(remote).await.map_err(|e| TransportError::Open {
            link: kind.name(),
            reason: e.to_string(),
        })?;

        info!("Link opened");
        Ok(Self {
            kind,
            socket,
            remote,
            sequence: SequenceCounters::default(),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

#[async_trait]
impl Link for UdpLink {
    fn kind(&self) -> LinkKind {
        self.kind
    }

    async fn send(&self, event: &ProtocolEvent) -> Result<(), TransportError> {
        let mut stamped = event.clone();
        stamped.sequence = self.sequence.next_tx();
        let frame = encode_event(&stamped)?;

        self.socket
            .send(&frame)
            .await
            .map_err(|e| TransportError::SendFailed {
                link: self.kind.name(),
                reason: e.to_string(),
            })?;
        debug!(link = self.kind.name(), event = stamped.kind_name(), seq = stamped.sequence, "Sent");
        Ok(())
    }

    async fn recv(&self) -> Result<ProtocolEvent, TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let len = self
            .socket
            .recv(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed {
                link: self.kind.name(),
                reason: e.to_string(),
            })?;

        let event = decode_event(&buf[..len]).map_err(|e| {
            warn!(link = self.kind.name(), len, error = %e, "Dropping malformed datagram");
            TransportError::Codec(e)
        })?;
        self.sequence.observe_rx(self.kind, event.sequence);
        Ok(event)
    }
}

/// Opens control on the configured ports and heartbeat on port + 1
pub struct UdpConnector {
    config: LinkConfig,
}

impl UdpConnector {
    pub fn new(config: LinkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn open(&self) -> Result<LinkPair, TransportError> {
        let bad_addr = |link: LinkKind| {
            move |e: crate::errors::TrunkGwError| TransportError::Open {
                link: link.name(),
                reason: e.to_string(),
            }
        };
        let (local, remote) = self
            .config
            .control_addrs()
            .map_err(bad_addr(LinkKind::Control))?;
        let control = UdpLink::bind(LinkKind::Control, local, remote).await?;

        let (local, remote) = self
            .config
            .heartbeat_addrs()
            .map_err(bad_addr(LinkKind::Heartbeat))?;
        let heartbeat = UdpLink::bind(LinkKind::Heartbeat, local, remote).await?;

        Ok(LinkPair {
            control: Box::new(control),
            heartbeat: Box::new(heartbeat),
        })
    }
}
