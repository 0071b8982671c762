//! Gateway signaling protocol events
//!
//! The engine only ever sees decoded [`ProtocolEvent`]s; byte layout lives in
//! [`codec`].

pub mod codec;

pub use codec::{decode_event, encode_event};

use crate::types::{CallerData, HuntGroup, Position, RequestId};

/// Progress flag: media is flowing
pub const FLAG_PROGRESS_MEDIA: u8 = 0x01;
/// Progress flag: far end is ringing
pub const FLAG_PROGRESS_RING: u8 = 0x02;

/// Event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    CallProgress = 0x50,
    CallReleased = 0x51,
    CallStart = 0x80,
    CallStartAck = 0x81,
    CallStartNack = 0x82,
    CallStartNackAck = 0x83,
    CallAnswered = 0x84,
    CallStopped = 0x85,
    CallStoppedAck = 0x86,
    SystemRestart = 0x87,
    SystemRestartAck = 0x88,
    Heartbeat = 0x89,
    InsertCheckLoop = 0x8a,
    RemoveCheckLoop = 0x8b,
    AutoCallGapAbate = 0x8c,
    DigitIn = 0x8d,
}

impl EventKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x50 => Some(Self::CallProgress),
            0x51 => Some(Self::CallReleased),
            0x80 => Some(Self::CallStart),
            0x81 => Some(Self::CallStartAck),
            0x82 => Some(Self::CallStartNack),
            0x83 => Some(Self::CallStartNackAck),
            0x84 => Some(Self::CallAnswered),
            0x85 => Some(Self::CallStopped),
            0x86 => Some(Self::CallStoppedAck),
            0x87 => Some(Self::SystemRestart),
            0x88 => Some(Self::SystemRestartAck),
            0x89 => Some(Self::Heartbeat),
            0x8a => Some(Self::InsertCheckLoop),
            0x8b => Some(Self::RemoveCheckLoop),
            0x8c => Some(Self::AutoCallGapAbate),
            0x8d => Some(Self::DigitIn),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CallProgress => "CALL_PROGRESS",
            Self::CallReleased => "CALL_RELEASED",
            Self::CallStart => "CALL_START",
            Self::CallStartAck => "CALL_START_ACK",
            Self::CallStartNack => "CALL_START_NACK",
            Self::CallStartNackAck => "CALL_START_NACK_ACK",
            Self::CallAnswered => "CALL_ANSWERED",
            Self::CallStopped => "CALL_STOPPED",
            Self::CallStoppedAck => "CALL_STOPPED_ACK",
            Self::SystemRestart => "SYSTEM_RESTART",
            Self::SystemRestartAck => "SYSTEM_RESTART_ACK",
            Self::Heartbeat => "HEARTBEAT",
            Self::InsertCheckLoop => "INSERT_CHECK_LOOP",
            Self::RemoveCheckLoop => "REMOVE_CHECK_LOOP",
            Self::AutoCallGapAbate => "AUTO_CALL_GAP_ABATE",
            Self::DigitIn => "DIGIT_IN",
        }
    }

    /// Events that are still processed while a span is suspended
    pub fn allowed_while_suspended(&self) -> bool {
        matches!(
            self,
            Self::SystemRestart | Self::SystemRestartAck | Self::Heartbeat
        )
    }
}

/// A decoded protocol event.
///
/// `kind` stays a raw byte so unknown identifiers survive decoding and can be
/// logged by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEvent {
    pub kind: u8,
    pub sequence: u32,
    pub request_id: RequestId,
    pub position: Position,
    pub trunk_group: u8,
    pub hunt_group: u8,
    pub release_cause: u8,
    pub flags: u8,
    pub screening: u8,
    pub presentation: u8,
    pub calling_digits: String,
    pub called_digits: String,
    pub calling_name: String,
    pub redirecting: String,
}

impl ProtocolEvent {
    /// A bare command for a position, as used for replies
    pub fn command(kind: EventKind, position: Position, request_id: RequestId, cause: u8) -> Self {
        Self {
            kind: kind as u8,
            sequence: 0,
            request_id,
            position,
            trunk_group: 0,
            hunt_group: HuntGroup::SequentialAscending as u8,
            release_cause: cause,
            flags: 0,
            screening: 0,
            presentation: 0,
            calling_digits: String::new(),
            called_digits: String::new(),
            calling_name: String::new(),
            redirecting: String::new(),
        }
    }

    /// Span-wide command (restart, restart ack, heartbeat)
    pub fn system(kind: EventKind) -> Self {
        Self::command(kind, Position::new(0, 0), 0, 0)
    }

    /// Outbound call setup request
    pub fn call_start(
        request_id: RequestId,
        caller: &CallerData,
        called: &str,
        trunk_group: u8,
        hunt_group: HuntGroup,
    ) -> Self {
        let mut event = Self::command(EventKind::CallStart, Position::new(0, 0), request_id, 0);
        event.trunk_group = trunk_group;
        event.hunt_group = hunt_group as u8;
        event.calling_digits = caller.cid_num.clone();
        event.called_digits = called.to_string();
        event.calling_name = caller.cid_name.clone();
        event.redirecting = caller.rdnis.clone();
        event.screening = caller.screen;
        event.presentation = caller.pres;
        event
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_u8(self.kind)
    }

    pub fn kind_name(&self) -> &'static str {
        self.event_kind().map(|k| k.name()).unwrap_or("UNKNOWN")
    }

    pub fn is(&self, kind: EventKind) -> bool {
        self.kind == kind as u8
    }

    pub fn media_ready(&self) -> bool {
        self.flags & FLAG_PROGRESS_MEDIA != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_lookup() {
        for raw in 0u8..=255 {
            if let Some(kind) = EventKind::from_u8(raw) {
                assert_eq!(kind as u8, raw);
            }
        }
        assert_eq!(EventKind::from_u8(0x42), None);
    }

    #[test]
    fn test_suspended_filter_set() {
        assert!(EventKind::Heartbeat.allowed_while_suspended());
        assert!(EventKind::SystemRestart.allowed_while_suspended());
        assert!(EventKind::SystemRestartAck.allowed_while_suspended());
        assert!(!EventKind::CallStart.allowed_while_suspended());
        assert!(!EventKind::CallStoppedAck.allowed_while_suspended());
    }

    #[test]
    fn test_call_start_carries_caller() {
        let caller = CallerData {
            cid_num: "4165550000".to_string(),
            cid_name: "Front Desk".to_string(),
            ..Default::default()
        };
        let event = ProtocolEvent::call_start(12, &caller, "18005551234", 3, HuntGroup::RoundRobinAscending);
        assert!(event.is(EventKind::CallStart));
        assert_eq!(event.request_id, 12);
        assert_eq!(event.trunk_group, 3);
        assert_eq!(event.hunt_group, 0x02);
        assert_eq!(event.calling_name, "Front Desk");
    }
}
