//! # Brivas Trunk Gateway Signaling
//!
//! Drives calls on a remote SS7/PSTN trunk gateway over its datagram
//! signaling protocol:
//!
//! - **Request pool** - correlation ids for locally originated calls
//! - **Channel state machine** - direction-aware call lifecycle per channel
//! - **Dispatcher** - routes gateway events to their handlers
//! - **Supervisor** - heartbeat loss detection and the restart handshake
//! - **Engine** - one loop per span over a control and a heartbeat link
//!
//! ## Example
//! ```rust,ignore
//! use brivas_trunkgw::{SpanEngine, TrunkGwConfig, UdpConnector};
//!
//! let config = TrunkGwConfig::from_file("trunkgw.json")?;
//! let span = &config.spans[0];
//! let engine = SpanEngine::new(
//!     span,
//!     config.engine.clone(),
//!     Arc::new(UdpConnector::new(span.link.clone())),
//!     listener,
//! )?;
//! engine.spawn();
//!
//! let channel = engine.request_channel(&caller, "18005551234@g1").await?;
//! ```

pub mod channel;
pub mod config;
pub mod congestion;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod fsm;
pub mod locator;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod signal;
pub mod span;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{EngineConfig, LinkConfig, SpanConfig, TrunkConfig, TrunkGwConfig};
pub use engine::{LoopExit, SpanEngine};
pub use errors::{Result, TrunkGwError};
pub use fsm::ChannelState;
pub use pool::{RequestPool, RequestStatus};
pub use protocol::{EventKind, ProtocolEvent};
pub use registry::SpanRegistry;
pub use signal::{SignalEvent, SignalKind, SignalListener, SignalRejected};
pub use span::{ChannelStatus, SpanStatus};
pub use transport::{Connector, Link, LinkKind, UdpConnector};
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default control port of the gateway; heartbeats use the next port
pub const DEFAULT_CONTROL_PORT: u16 = 53000;
