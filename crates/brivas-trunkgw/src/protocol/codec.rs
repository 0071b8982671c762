//! Event Encoding/Decoding
//!
//! Layout (big endian):
//! `[kind:1][seq:4][request_id:2][trunk:1][slot:1][trunk_group:1][hunt_group:1]`
//! `[cause:1][flags:1][screening:1][presentation:1]` followed by four
//! length-prefixed strings: calling digits, called digits, calling name,
//! redirecting.

use super::ProtocolEvent;
use crate::errors::CodecError;
use crate::types::Position;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed header length
pub const HEADER_LEN: usize = 14;

const MAX_DIGITS: usize = 32;
const MAX_TEXT: usize = 128;

/// Encode an event
pub fn encode_event(event: &ProtocolEvent) -> Result<BytesMut, CodecError> {
    let mut buf = BytesMut::with_capacity(
        HEADER_LEN
            + 4
            + event.calling_digits.len()
            + event.called_digits.len()
            + event.calling_name.len()
            + event.redirecting.len(),
    );
    buf.put_u8(event.kind);
    buf.put_u32(event.sequence);
    buf.put_u16(event.request_id);
    buf.put_u8(event.position.trunk);
    buf.put_u8(event.position.slot);
    buf.put_u8(event.trunk_group);
    buf.put_u8(event.hunt_group);
    buf.put_u8(event.release_cause);
    buf.put_u8(event.flags);
    buf.put_u8(event.screening);
    buf.put_u8(event.presentation);

    put_string(&mut buf, "calling_digits", &event.calling_digits, MAX_DIGITS)?;
    put_string(&mut buf, "called_digits", &event.called_digits, MAX_DIGITS)?;
    put_string(&mut buf, "calling_name", &event.calling_name, MAX_TEXT)?;
    put_string(&mut buf, "redirecting", &event.redirecting, MAX_TEXT)?;

    Ok(buf)
}

/// Decode an event
pub fn decode_event(data: &[u8]) -> Result<ProtocolEvent, CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::BufferTooShort {
            needed: HEADER_LEN,
            available: data.len(),
        });
    }

    let mut buf = data;
    let kind = buf.get_u8();
    let sequence = buf.get_u32();
    let request_id = buf.get_u16();
    let trunk = buf.get_u8();
    let slot = buf.get_u8();
    let trunk_group = buf.get_u8();
    let hunt_group = buf.get_u8();
    let release_cause = buf.get_u8();
    let flags = buf.get_u8();
    let screening = buf.get_u8();
    let presentation = buf.get_u8();

    let calling_digits = get_string(&mut buf, "calling_digits", MAX_DIGITS)?;
    let called_digits = get_string(&mut buf, "called_digits", MAX_DIGITS)?;
    let calling_name = get_string(&mut buf, "calling_name", MAX_TEXT)?;
    let redirecting = get_string(&mut buf, "redirecting", MAX_TEXT)?;

    Ok(ProtocolEvent {
        kind,
        sequence,
        request_id,
        position: Position::new(trunk, slot),
        trunk_group,
        hunt_group,
        release_cause,
        flags,
        screening,
        presentation,
        calling_digits,
        called_digits,
        calling_name,
        redirecting,
    })
}

fn put_string(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), CodecError> {
    if value.len() > max {
        return Err(CodecError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut &[u8], field: &'static str, max: usize) -> Result<String, CodecError> {
    // Trailing strings may be omitted entirely by older gateways
    if !buf.has_remaining() {
        return Ok(String::new());
    }
    let len = buf.get_u8() as usize;
    if len > max {
        return Err(CodecError::FieldTooLong { field, len });
    }
    if buf.remaining() < len {
        return Err(CodecError::BufferTooShort {
            needed: len,
            available: buf.remaining(),
        });
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventKind;

    #[test]
    fn test_encode_decode_call_start() {
        let mut event = ProtocolEvent::command(EventKind::CallStart, Position::new(1, 4), 0, 0);
        event.sequence = 77;
        event.calling_digits = "1800".to_string();
        event.called_digits = "4165551234".to_string();
        event.redirecting = "RDNIS-9051112222".to_string();

        let encoded = encode_event(&event).unwrap();
        assert_eq!(encoded[0], 0x80);
        assert_eq!(decode_event(&encoded).unwrap(), event);
    }

    #[test]
    fn test_short_header_rejected() {
        let err = decode_event(&[0x89, 0, 0]).unwrap_err();
        assert_eq!(err, CodecError::BufferTooShort { needed: HEADER_LEN, available: 3 });
    }

    #[test]
    fn test_header_only_event_decodes() {
        let event = ProtocolEvent::system(EventKind::Heartbeat);
        let encoded = encode_event(&event).unwrap();
        let decoded = decode_event(&encoded[..HEADER_LEN]).unwrap();
        assert!(decoded.is(EventKind::Heartbeat));
        assert!(decoded.called_digits.is_empty());
    }

    #[test]
    fn test_truncated_string_rejected() {
        let mut event = ProtocolEvent::system(EventKind::DigitIn);
        event.called_digits = "123".to_string();
        let encoded = encode_event(&event).unwrap();
        let truncated = &encoded[..encoded.len() - 4];
        assert!(matches!(
            decode_event(truncated),
            Err(CodecError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_oversized_digits_rejected() {
        let mut event = ProtocolEvent::system(EventKind::CallStart);
        event.called_digits = "1".repeat(40);
        assert!(matches!(
            encode_event(&event),
            Err(CodecError::FieldTooLong { field: "called_digits", .. })
        ));
    }
}
