//! Wire codec and bounds checking.
//!
//! Every datagram starts with a fixed header:
//! ```text
//! +----------+---------------+------------------+
//! | TYPE (1B)| CID (4B BE)   | PAYLOAD (N bytes)|
//! +----------+---------------+------------------+
//! ```
//!
//! Payload formats by type:
//! ```text
//! HANDSHAKE_INIT / HANDSHAKE_RESP:  ephemeral_pub[32] || sealed_cert_blob
//! MSG / ACK:                        nonce[12] || ciphertext (>= tag)
//! RECONNECT_* / PENDING_*:          empty
//! ```
//!
//! The sealed certificate blob decrypts to:
//! ```text
//! len(pub):u16 BE || x25519_pub[32] || len(cert):u16 BE || cert_der
//! ```

use zeroize::Zeroizing;

use crate::error::ProtocolError;

/// Fixed header size: type byte plus big-endian CID.
pub const HEADER_LEN: usize = 5;

/// Maximum accepted datagram size.
pub const MAX_DATAGRAM_LEN: usize = 4096;

/// AEAD nonce size on the wire.
pub const NONCE_LEN: usize = 12;

/// Curve25519 public key size.
pub const PUBKEY_LEN: usize = 32;

/// Poly1305 authentication tag size.
pub const TAG_LEN: usize = 16;

/// Packet type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// First handshake message, initiator to responder.
    HandshakeInit = 0x01,

    /// Encrypted application message.
    Msg = 0x02,

    /// Second handshake message, responder to initiator.
    HandshakeResp = 0x03,

    /// Encrypted acknowledgement; plaintext is the acked UUID bytes.
    Ack = 0x04,

    /// Request to resume a suspended session under its remembered CID.
    ReconnectReq = 0x05,

    /// Positive answer to a reconnect request.
    ReconnectResp = 0x06,

    /// Marks the start of a drained-queue burst.
    PendingSend = 0x07,

    /// Marks the end of a drained-queue burst.
    PendingDone = 0x08,
}

impl PacketType {
    /// Parse a packet type from its wire byte.
    /// Returns `MalformedPacket` for unknown types. No fallback.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::HandshakeInit),
            0x02 => Ok(Self::Msg),
            0x03 => Ok(Self::HandshakeResp),
            0x04 => Ok(Self::Ack),
            0x05 => Ok(Self::ReconnectReq),
            0x06 => Ok(Self::ReconnectResp),
            0x07 => Ok(Self::PendingSend),
            0x08 => Ok(Self::PendingDone),
            _ => Err(ProtocolError::MalformedPacket),
        }
    }

    /// Convert to the wire byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Control packets carry no payload.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::ReconnectReq | Self::ReconnectResp | Self::PendingSend | Self::PendingDone
        )
    }
}

/// A validated wire packet.
///
/// Validation happens at parse time; a `Packet` in hand has a known type,
/// a CID, and a payload whose outer bounds have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    packet_type: PacketType,
    cid: u32,
    payload: Vec<u8>,
}

impl Packet {
    /// Parse a datagram.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` if the datagram is shorter than the header, larger
    /// than [`MAX_DATAGRAM_LEN`], has an unknown type byte, or carries a
    /// payload on a control type.
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < HEADER_LEN || datagram.len() > MAX_DATAGRAM_LEN {
            return Err(ProtocolError::MalformedPacket);
        }

        let packet_type = PacketType::from_byte(datagram[0])?;
        let cid = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
        let payload = datagram[HEADER_LEN..].to_vec();

        if packet_type.is_control() && !payload.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }

        Ok(Self {
            packet_type,
            cid,
            payload,
        })
    }

    /// Build a handshake packet (`HandshakeInit` or `HandshakeResp`).
    pub fn handshake(
        packet_type: PacketType,
        cid: u32,
        ephemeral_pub: &[u8; PUBKEY_LEN],
        sealed: &[u8],
    ) -> Result<Self, ProtocolError> {
        if !matches!(
            packet_type,
            PacketType::HandshakeInit | PacketType::HandshakeResp
        ) {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut payload = Vec::with_capacity(PUBKEY_LEN + sealed.len());
        payload.extend_from_slice(ephemeral_pub);
        payload.extend_from_slice(sealed);
        let packet = Self {
            packet_type,
            cid,
            payload,
        };
        packet.check_size()?;
        Ok(packet)
    }

    /// Build a record packet (`Msg` or `Ack`) from a sealed record payload.
    pub fn record(
        packet_type: PacketType,
        cid: u32,
        sealed_record: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        if !matches!(packet_type, PacketType::Msg | PacketType::Ack) {
            return Err(ProtocolError::MalformedPacket);
        }
        let packet = Self {
            packet_type,
            cid,
            payload: sealed_record,
        };
        packet.check_size()?;
        Ok(packet)
    }

    /// Build an empty control packet.
    pub fn control(packet_type: PacketType, cid: u32) -> Result<Self, ProtocolError> {
        if !packet_type.is_control() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Self {
            packet_type,
            cid,
            payload: Vec::new(),
        })
    }

    fn check_size(&self) -> Result<(), ProtocolError> {
        if HEADER_LEN + self.payload.len() > MAX_DATAGRAM_LEN {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(())
    }

    /// Get the packet type.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Get the connection identifier.
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Get the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(HEADER_LEN + self.payload.len());
        wire.push(self.packet_type.to_byte());
        wire.extend_from_slice(&self.cid.to_be_bytes());
        wire.extend_from_slice(&self.payload);
        wire
    }
}

/// Parsed payload of a handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload<'a> {
    /// Sender's ephemeral Curve25519 public key.
    pub ephemeral_pub: [u8; PUBKEY_LEN],
    /// AEAD-sealed certificate blob (ciphertext plus tag).
    pub sealed: &'a [u8],
}

impl<'a> HandshakePayload<'a> {
    /// Split a handshake payload into ephemeral key and sealed blob.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` if the payload cannot hold the ephemeral key and
    /// at least an AEAD tag.
    pub fn parse(payload: &'a [u8]) -> Result<Self, ProtocolError> {
        if payload.len() < PUBKEY_LEN + TAG_LEN {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut ephemeral_pub = [0u8; PUBKEY_LEN];
        ephemeral_pub.copy_from_slice(&payload[..PUBKEY_LEN]);
        Ok(Self {
            ephemeral_pub,
            sealed: &payload[PUBKEY_LEN..],
        })
    }
}

/// Plaintext contents of the sealed certificate blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertBlob {
    /// Sender's long-lived Curve25519 public key.
    pub static_pub: [u8; PUBKEY_LEN],
    /// Sender's certificate, DER-encoded.
    pub cert_der: Vec<u8>,
}

impl CertBlob {
    /// Serialize the blob plaintext.
    // Casts are safe: PUBKEY_LEN is 32 and cert_der fits in a datagram.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(2 + PUBKEY_LEN + 2 + self.cert_der.len());
        out.extend_from_slice(&(PUBKEY_LEN as u16).to_be_bytes());
        out.extend_from_slice(&self.static_pub);
        out.extend_from_slice(&(self.cert_der.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.cert_der);
        Zeroizing::new(out)
    }

    /// Parse the blob plaintext.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` if either length field overshoots the buffer, the
    /// public key is not exactly 32 bytes, the certificate is empty, or
    /// trailing bytes remain.
    pub fn parse(plain: &[u8]) -> Result<Self, ProtocolError> {
        if plain.len() < 2 {
            return Err(ProtocolError::MalformedPacket);
        }
        let pub_len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
        if pub_len != PUBKEY_LEN || plain.len() < 2 + pub_len + 2 {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut static_pub = [0u8; PUBKEY_LEN];
        static_pub.copy_from_slice(&plain[2..2 + PUBKEY_LEN]);

        let off = 2 + PUBKEY_LEN;
        let cert_len = u16::from_be_bytes([plain[off], plain[off + 1]]) as usize;
        let cert_start = off + 2;
        if cert_len == 0 || plain.len() != cert_start + cert_len {
            return Err(ProtocolError::MalformedPacket);
        }

        Ok(Self {
            static_pub,
            cert_der: plain[cert_start..].to_vec(),
        })
    }
}

/// Parsed payload of a record packet (`Msg` or `Ack`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPayload<'a> {
    /// Per-message random nonce.
    pub nonce: [u8; NONCE_LEN],
    /// AEAD ciphertext plus tag.
    pub ciphertext: &'a [u8],
}

impl<'a> RecordPayload<'a> {
    /// Split a record payload into nonce and ciphertext.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` if the payload cannot hold the nonce and a tag.
    pub fn parse(payload: &'a [u8]) -> Result<Self, ProtocolError> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&payload[..NONCE_LEN]);
        Ok(Self {
            nonce,
            ciphertext: &payload[NONCE_LEN..],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_roundtrip() {
        for byte in 0x01..=0x08 {
            let pt = PacketType::from_byte(byte).unwrap();
            assert_eq!(pt.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_packet_type() {
        for byte in [0x00, 0x09, 0x10, 0xFF] {
            assert_eq!(
                PacketType::from_byte(byte),
                Err(ProtocolError::MalformedPacket)
            );
        }
    }

    #[test]
    fn test_parse_short_datagram() {
        assert_eq!(Packet::parse(&[]), Err(ProtocolError::MalformedPacket));
        assert_eq!(
            Packet::parse(&[0x02, 0, 0, 0]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn test_parse_oversized_datagram() {
        let big = vec![0x02; MAX_DATAGRAM_LEN + 1];
        assert_eq!(Packet::parse(&big), Err(ProtocolError::MalformedPacket));
    }

    #[test]
    fn test_control_with_payload_rejected() {
        let wire = [0x05, 0xDE, 0xAD, 0xBE, 0xEF, 0x01];
        assert_eq!(Packet::parse(&wire), Err(ProtocolError::MalformedPacket));
    }

    #[test]
    fn test_control_roundtrip() {
        let packet = Packet::control(PacketType::ReconnectReq, 0xDEADBEEF).unwrap();
        let wire = packet.encode();
        assert_eq!(wire, [0x05, 0xDE, 0xAD, 0xBE, 0xEF]);

        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.packet_type(), PacketType::ReconnectReq);
        assert_eq!(parsed.cid(), 0xDEADBEEF);
        assert!(parsed.payload().is_empty());
    }

    #[test]
    fn test_record_roundtrip() {
        let mut payload = vec![0u8; NONCE_LEN];
        payload.extend_from_slice(&[0xAB; 20]);
        let packet = Packet::record(PacketType::Msg, 7, payload.clone()).unwrap();
        let wire = packet.encode();
        assert_eq!(wire.len(), HEADER_LEN + payload.len());

        let parsed = Packet::parse(&wire).unwrap();
        assert_eq!(parsed.packet_type(), PacketType::Msg);
        assert_eq!(parsed.cid(), 7);

        let record = RecordPayload::parse(parsed.payload()).unwrap();
        assert_eq!(record.nonce, [0u8; NONCE_LEN]);
        assert_eq!(record.ciphertext, &[0xAB; 20]);
    }

    #[test]
    fn test_record_payload_too_short() {
        assert_eq!(
            RecordPayload::parse(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn test_handshake_payload_too_short() {
        assert_eq!(
            HandshakePayload::parse(&[0u8; PUBKEY_LEN]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn test_cert_blob_roundtrip() {
        let blob = CertBlob {
            static_pub: [0x42; PUBKEY_LEN],
            cert_der: vec![0x30, 0x82, 0x01, 0x00],
        };
        let plain = blob.encode();
        let parsed = CertBlob::parse(&plain).unwrap();
        assert_eq!(parsed, blob);
    }

    #[test]
    fn test_cert_blob_length_overshoot() {
        let blob = CertBlob {
            static_pub: [0x42; PUBKEY_LEN],
            cert_der: vec![0x30; 16],
        };
        let plain = blob.encode();

        // Truncated buffer: cert length field overshoots.
        assert_eq!(
            CertBlob::parse(&plain[..plain.len() - 1]),
            Err(ProtocolError::MalformedPacket)
        );

        // Trailing garbage is rejected too.
        let mut extended = plain.to_vec();
        extended.push(0x00);
        assert_eq!(
            CertBlob::parse(&extended),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn test_cert_blob_bad_pub_len() {
        let mut plain = Vec::new();
        plain.extend_from_slice(&31u16.to_be_bytes());
        plain.extend_from_slice(&[0u8; 31]);
        plain.extend_from_slice(&1u16.to_be_bytes());
        plain.push(0x30);
        assert_eq!(CertBlob::parse(&plain), Err(ProtocolError::MalformedPacket));
    }
}
