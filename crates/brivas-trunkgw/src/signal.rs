//! Notifications delivered to the switch

use crate::types::{CallerData, Position, SpanId};
use thiserror::Error;

/// What happened on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Incoming call offered
    Start,
    /// Early media / progress on an outbound call
    ProgressMedia,
    /// Outbound call answered
    Up,
    /// Call ended
    Stop,
    /// Channel forced through a link restart
    Restart,
    /// Channel back to idle
    Idle,
}

/// A notification for one channel
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub span_id: SpanId,
    pub channel: usize,
    pub position: Position,
    pub kind: SignalKind,
    pub caller: CallerData,
}

/// The switch refused a notification
#[derive(Debug, Clone, Error)]
#[error("Signal rejected: {0}")]
pub struct SignalRejected(pub String);

/// Callback registered per span by the switch.
///
/// Called with the channel lock held: implementations must not call back
/// into the engine for the same channel.
pub trait SignalListener: Send + Sync {
    fn on_signal(&self, event: &SignalEvent) -> Result<(), SignalRejected>;
}

impl<F> SignalListener for F
where
    F: Fn(&SignalEvent) -> Result<(), SignalRejected> + Send + Sync,
{
    fn on_signal(&self, event: &SignalEvent) -> Result<(), SignalRejected> {
        self(event)
    }
}
