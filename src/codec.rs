//! # Wire Codec
//!
//! A self-describing frame: a 128-byte fixed header followed by a variable
//! payload. Header layout:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0-1 | 2 | Magic `0x56 0x32` ("V2") |
//! | 2 | 1 | Protocol version (currently `0x01`) |
//! | 3 | 1 | Encoding tag |
//! | 4 | 1 | Message type tag |
//! | 5-7 | 3 | Reserved, zero |
//! | 8-11 | 4 | Payload length, big-endian |
//! | 12-43 | 32 | Message id (null-padded, truncated) |
//! | 44-75 | 32 | Source id |
//! | 76-107 | 32 | Target id |
//! | 108-127 | 20 | Correlation id |
//!
//! Re-encoding a decoded message is byte-identical to the original encoding
//! for the same encoding tag; the only information loss is the declared
//! truncation of the four string fields to their fixed widths.

use crate::error::{BrokerError, Result};
use crate::message::{
    Encoding, Message, MessageType, CORRELATION_FIELD_LEN, ID_FIELD_LEN, SOURCE_FIELD_LEN,
    TARGET_FIELD_LEN,
};

pub const HEADER_LEN: usize = 128;
pub const MAGIC: [u8; 2] = [0x56, 0x32];
pub const PROTOCOL_VERSION: u8 = 0x01;

const ID_OFFSET: usize = 12;
const SOURCE_OFFSET: usize = 44;
const TARGET_OFFSET: usize = 76;
const CORRELATION_OFFSET: usize = 108;

/// Copy `value` into `field` left-aligned and null-padded, truncating if
/// `value` is longer than the field. This is the codec's declared, and
/// deterministic, truncation policy.
fn write_fixed_field(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Read a null-padded fixed field back into a `String`, stopping at the
/// first NUL (or the field's end if there is none).
fn read_fixed_field(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Encode `message` into a single contiguous frame (`header || payload`).
///
/// Refuses to encode if the payload exceeds `max_message_size`.
pub fn encode(message: &Message, max_message_size: usize) -> Result<Vec<u8>> {
    let payload = match message.encoding {
        Encoding::Json => message.payload.clone(),
        Encoding::BinaryContainer => {
            let mut wrapped = Vec::with_capacity(4 + message.payload.len());
            wrapped.extend_from_slice(&(message.payload.len() as u32).to_be_bytes());
            wrapped.extend_from_slice(&message.payload);
            wrapped
        }
        Encoding::Plain => message.payload.clone(),
    };

    if payload.len() > max_message_size {
        return Err(BrokerError::InvalidFrame(format!(
            "payload of {} bytes exceeds max_message_size of {}",
            payload.len(),
            max_message_size
        )));
    }

    let mut frame = vec![0u8; HEADER_LEN + payload.len()];
    frame[0..2].copy_from_slice(&MAGIC);
    frame[2] = PROTOCOL_VERSION;
    frame[3] = message.encoding.tag();
    frame[4] = message.message_type.tag();
    // bytes 5..8 stay zero (reserved)
    frame[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    write_fixed_field(&mut frame[ID_OFFSET..ID_OFFSET + ID_FIELD_LEN], &message.id);
    write_fixed_field(
        &mut frame[SOURCE_OFFSET..SOURCE_OFFSET + SOURCE_FIELD_LEN],
        &message.source,
    );
    write_fixed_field(
        &mut frame[TARGET_OFFSET..TARGET_OFFSET + TARGET_FIELD_LEN],
        &message.target,
    );
    write_fixed_field(
        &mut frame[CORRELATION_OFFSET..CORRELATION_OFFSET + CORRELATION_FIELD_LEN],
        &message.correlation_id,
    );

    frame[HEADER_LEN..].copy_from_slice(&payload);
    Ok(frame)
}

/// Decode a complete frame (header + payload) into a [`Message`].
///
/// Fails with `InvalidFrame` on magic mismatch, a header shorter than
/// [`HEADER_LEN`], or a declared payload length that doesn't match the
/// bytes actually supplied / exceeds `max_message_size`.
pub fn decode(frame: &[u8], max_message_size: usize) -> Result<Message> {
    if frame.len() < HEADER_LEN {
        return Err(BrokerError::InvalidFrame(format!(
            "frame too short: {} bytes, need at least {}",
            frame.len(),
            HEADER_LEN
        )));
    }

    if frame[0..2] != MAGIC {
        return Err(BrokerError::InvalidFrame(format!(
            "bad magic: {:02x?}",
            &frame[0..2]
        )));
    }

    let encoding = Encoding::from_tag(frame[3])
        .ok_or_else(|| BrokerError::InvalidFrame(format!("unknown encoding tag {}", frame[3])))?;
    let message_type = MessageType::from_tag(frame[4])
        .ok_or_else(|| BrokerError::InvalidFrame(format!("unknown type tag {}", frame[4])))?;

    let payload_len = u32::from_be_bytes(frame[8..12].try_into().unwrap()) as usize;
    if payload_len > max_message_size {
        return Err(BrokerError::InvalidFrame(format!(
            "payload_len {} exceeds max_message_size {}",
            payload_len, max_message_size
        )));
    }
    if frame.len() != HEADER_LEN + payload_len {
        return Err(BrokerError::InvalidFrame(format!(
            "frame length {} does not match header-declared payload_len {}",
            frame.len(),
            payload_len
        )));
    }

    let id = read_fixed_field(&frame[ID_OFFSET..ID_OFFSET + ID_FIELD_LEN]);
    let source = read_fixed_field(&frame[SOURCE_OFFSET..SOURCE_OFFSET + SOURCE_FIELD_LEN]);
    let target = read_fixed_field(&frame[TARGET_OFFSET..TARGET_OFFSET + TARGET_FIELD_LEN]);
    let correlation_id =
        read_fixed_field(&frame[CORRELATION_OFFSET..CORRELATION_OFFSET + CORRELATION_FIELD_LEN]);

    let raw_payload = &frame[HEADER_LEN..];
    let (payload, error) = match encoding {
        Encoding::Json => (raw_payload.to_vec(), extract_json_error(raw_payload)),
        Encoding::BinaryContainer => {
            if raw_payload.len() < 4 {
                return Err(BrokerError::InvalidFrame(
                    "binary container payload missing length prefix".to_string(),
                ));
            }
            let inner_len = u32::from_be_bytes(raw_payload[0..4].try_into().unwrap()) as usize;
            if raw_payload.len() != 4 + inner_len {
                return Err(BrokerError::InvalidFrame(
                    "binary container inner length mismatch".to_string(),
                ));
            }
            let inner = &raw_payload[4..];
            (inner.to_vec(), extract_json_error(inner))
        }
        Encoding::Plain => {
            let error = if message_type == MessageType::Error {
                Some(String::from_utf8_lossy(raw_payload).into_owned())
            } else {
                None
            };
            (raw_payload.to_vec(), error)
        }
    };

    Ok(Message {
        message_type,
        id,
        source,
        target,
        correlation_id,
        encoding,
        payload,
        error,
    })
}

/// For JSON/binary-container error messages, pull the `error` field out of
/// the `{"error":"<text>"}` payload so `Message::error` is populated the
/// same way regardless of encoding.
fn extract_json_error(payload: &[u8]) -> Option<String> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_owned)
}

/// Peek the first two bytes of `buf` and report whether they look like a
/// framed (magic-prefixed) message. Implements the mandatory "peek rule"
/// for streams that may mix legacy newline-delimited JSON and framed
/// traffic.
pub fn looks_framed(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0..2] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut m = Message::request("ping", "caller", "worker");
        m.correlation_id = "corr-1".to_string();
        m.payload = br#"{"n":1}"#.to_vec();
        m
    }

    #[test]
    fn round_trip_is_identity() {
        let msg = sample();
        let frame = encode(&msg, 1024).unwrap();
        let decoded = decode(&frame, 1024).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn re_encode_is_byte_identical() {
        let msg = sample();
        let frame1 = encode(&msg, 1024).unwrap();
        let decoded = decode(&frame1, 1024).unwrap();
        let frame2 = encode(&decoded, 1024).unwrap();
        assert_eq!(frame1, frame2);
    }

    #[test]
    fn overlong_ids_are_truncated_deterministically() {
        let long_id = "x".repeat(50);
        let msg = Message::request(long_id.clone(), "caller", "worker");
        let frame = encode(&msg, 1024).unwrap();
        let decoded = decode(&frame, 1024).unwrap();
        assert_eq!(decoded.id, &long_id[..ID_FIELD_LEN]);

        // Re-encoding the truncated value is stable.
        let frame2 = encode(&decoded, 1024).unwrap();
        assert_eq!(frame, frame2);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let msg = sample();
        let mut frame = encode(&msg, 1024).unwrap();
        frame[0] = 0xff;
        let err = decode(&frame, 1024).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidFrame(_)));
    }

    #[test]
    fn oversize_payload_is_refused_on_both_paths() {
        let mut msg = sample();
        msg.payload = vec![0u8; 200];
        assert!(encode(&msg, 100).is_err());

        let frame = encode(&msg, 1024).unwrap();
        assert!(decode(&frame, 100).is_err());
    }

    #[test]
    fn header_fields_decode_as_expected() {
        let mut msg = Message::request("req-id", "src", "tgt");
        msg.payload = vec![0u8; 200];
        let frame = encode(&msg, 1024).unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 200);
        assert_eq!(&frame[0..2], &MAGIC);
        assert_eq!(frame[2], PROTOCOL_VERSION);
        assert_eq!(frame[4], MessageType::Request.tag());
        let declared_len = u32::from_be_bytes(frame[8..12].try_into().unwrap());
        assert_eq!(declared_len, 200);
    }

    #[test]
    fn error_payload_round_trips_message() {
        let req = Message::request("ping", "caller", "worker");
        let mut err = Message::error_to(&req, "worker", "boom");
        err.payload = br#"{"error":"boom"}"#.to_vec();
        let frame = encode(&err, 1024).unwrap();
        let decoded = decode(&frame, 1024).unwrap();
        assert_eq!(decoded.error.as_deref(), Some("boom"));
    }

    #[test]
    fn peek_rule_distinguishes_framed_from_legacy_json() {
        let msg = sample();
        let frame = encode(&msg, 1024).unwrap();
        assert!(looks_framed(&frame));
        assert!(!looks_framed(br#"{"id":"ping"}"#));
    }
}
