//! Error types for the trunk gateway signaling engine

use crate::fsm::ChannelState;
use crate::types::{Direction, RequestId};
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, TrunkGwError>;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum TrunkGwError {
    #[error("Request pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("State machine error: {0}")]
    State(#[from] StateError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Span {0} is suspended")]
    SpanSuspended(u32),

    #[error("Trunk group {0} is congested")]
    Congested(u8),

    #[error("All circuits are busy")]
    AllCircuitsBusy,

    #[error("Call setup rejected by gateway (cause {cause})")]
    Rejected { cause: u8 },

    #[error("Timed out waiting for the gateway")]
    Timeout,

    #[error("Unknown channel {0}")]
    UnknownChannel(usize),

    #[error("Engine is shutting down")]
    Shutdown,
}

/// Request pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("All {0} request ids are busy")]
    Exhausted(usize),

    #[error("Request id {0} is out of range")]
    OutOfRange(RequestId),

    #[error("Request id {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: RequestId,
        expected: &'static str,
        actual: &'static str,
    },
}

/// Channel state machine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("Illegal {direction:?} transition {from:?} -> {to:?}")]
    IllegalTransition {
        direction: Direction,
        from: ChannelState,
        to: ChannelState,
    },
}

/// Link level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open {link} link: {reason}")]
    Open { link: &'static str, reason: String },

    #[error("Send failed on {link} link: {reason}")]
    SendFailed { link: &'static str, reason: String },

    #[error("Receive failed on {link} link: {reason}")]
    ReceiveFailed { link: &'static str, reason: String },

    #[error("{0} link closed")]
    Closed(&'static str),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    #[error("Field {field} too long ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}
