//! Application message pipeline helpers.
//!
//! Plaintext schema on the wire: `uuid_ascii[36] || "|" || utf8_text`.
//! The UUID is a v4 generated at send time; the ACK plaintext is the bare
//! UUID bytes. A peer that sends text without the UUID prefix still gets
//! its message delivered, but nothing is acknowledged for it.

use std::time::Duration;

use cardwire_core::ProtocolError;
use uuid::Uuid;

/// Hyphenated UUID length on the wire.
pub const UUID_ASCII_LEN: usize = 36;

/// Transmission attempts per message before the session is suspended.
pub const MAX_SEND_ATTEMPTS: u32 = 5;

/// Handshake retransmissions before the session is closed.
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Encode `uuid|text` for sealing.
pub fn encode_plaintext(uuid: &Uuid, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(UUID_ASCII_LEN + 1 + text.len());
    out.extend_from_slice(uuid.hyphenated().to_string().as_bytes());
    out.push(b'|');
    out.extend_from_slice(text.as_bytes());
    out
}

/// Decode a decrypted message payload.
///
/// Returns the UUID when the payload carries the `uuid|` prefix, and the
/// text either way. Bare text without a parseable prefix is passed
/// through with no UUID.
///
/// # Errors
///
/// `MalformedPacket` if the plaintext is not valid UTF-8.
pub fn decode_plaintext(plain: &[u8]) -> Result<(Option<Uuid>, String), ProtocolError> {
    let text = std::str::from_utf8(plain).map_err(|_| ProtocolError::MalformedPacket)?;
    match text.split_once('|') {
        Some((prefix, rest)) if prefix.len() == UUID_ASCII_LEN => match Uuid::try_parse(prefix) {
            Ok(uuid) => Ok((Some(uuid), rest.to_string())),
            Err(_) => Ok((None, text.to_string())),
        },
        _ => Ok((None, text.to_string())),
    }
}

/// Encode an ACK plaintext: the UUID bytes alone.
pub fn encode_ack(uuid: &Uuid) -> Vec<u8> {
    uuid.hyphenated().to_string().into_bytes()
}

/// Decode an ACK plaintext.
///
/// # Errors
///
/// `MalformedPacket` if the plaintext is not a hyphenated UUID.
pub fn decode_ack(plain: &[u8]) -> Result<Uuid, ProtocolError> {
    let text = std::str::from_utf8(plain).map_err(|_| ProtocolError::MalformedPacket)?;
    Uuid::try_parse(text).map_err(|_| ProtocolError::MalformedPacket)
}

/// Exponential backoff: `base * 2^attempts`, saturating.
///
/// Used for both handshake retransmissions and per-message retries.
pub fn backoff(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(1u32 << attempts.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_roundtrip() {
        let uuid = Uuid::try_parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let plain = encode_plaintext(&uuid, "hola");
        assert_eq!(plain.len(), 36 + 1 + 4);

        let (parsed, text) = decode_plaintext(&plain).unwrap();
        assert_eq!(parsed, Some(uuid));
        assert_eq!(text, "hola");
    }

    #[test]
    fn test_text_containing_separator() {
        let uuid = Uuid::new_v4();
        let plain = encode_plaintext(&uuid, "a|b|c");
        let (parsed, text) = decode_plaintext(&plain).unwrap();
        assert_eq!(parsed, Some(uuid));
        assert_eq!(text, "a|b|c");
    }

    #[test]
    fn test_bare_text_has_no_uuid() {
        let (uuid, text) = decode_plaintext(b"hola").unwrap();
        assert_eq!(uuid, None);
        assert_eq!(text, "hola");

        // A prefix that is not a UUID is kept as text.
        let (uuid, text) = decode_plaintext(b"not-a-uuid-but-thirty-six-chars-long|x").unwrap();
        assert_eq!(uuid, None);
        assert_eq!(text, "not-a-uuid-but-thirty-six-chars-long|x");
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert_eq!(
            decode_plaintext(&[0xFF, 0xFE]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn test_ack_roundtrip() {
        let uuid = Uuid::new_v4();
        assert_eq!(decode_ack(&encode_ack(&uuid)).unwrap(), uuid);
        assert_eq!(decode_ack(b"junk"), Err(ProtocolError::MalformedPacket));
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(3);
        assert_eq!(backoff(base, 0), Duration::from_secs(3));
        assert_eq!(backoff(base, 1), Duration::from_secs(6));
        assert_eq!(backoff(base, 2), Duration::from_secs(12));
    }
}
