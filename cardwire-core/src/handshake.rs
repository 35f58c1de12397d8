//! Two-message IK-flavored handshake.
//!
//! ```text
//! initiator                                   responder
//!   e_i = ephemeral keypair
//!   INIT: cid, e_i_pub, seal(e_i_pub, cert_i)  -->
//!                                               open blob with e_i_pub
//!                                               verify cert_i
//!                                               ss = dh(static_r, e_i_pub)
//!   <--  RESP: cid, e_r_pub, seal(e_r_pub, cert_r)
//!   open blob with e_r_pub, verify cert_r
//!   ss = dh(e_i, static_r_pub)
//! ```
//!
//! Both sides derive `session_key = kdf(ss, 32)`; the two `ss` values are
//! equal by Curve25519 symmetry. The certificate blob is sealed under the
//! sender's own ephemeral public key with `nonce = kdf(e_pub, 32)[0..12]`
//! — integrity against a network attacker who cannot guess the ephemeral,
//! exactly as the wire format defines it. Binding the blob under the
//! derived session key instead would be a protocol change.
//!
//! The responder's ephemeral must stay stable per CID for the duration of
//! one handshake; callers cache the RESP packet and re-emit it verbatim
//! for retransmitted INITs.

use crate::crypto::{aead_open, aead_seal, kdf, EphemeralKeypair, SessionKey, KEY_LEN};
use crate::error::ProtocolError;
use crate::identity::{Identity, LocalIdentity, TrustRoots};
use crate::packet::{CertBlob, HandshakePayload, Packet, PacketType, NONCE_LEN, PUBKEY_LEN};

/// What a completed handshake yields: who the peer is and the key shared
/// with them.
pub struct PeerCredentials {
    /// Verified peer identity.
    pub identity: Identity,
    /// Peer's long-lived Curve25519 public key, as carried in the blob.
    pub static_public: [u8; PUBKEY_LEN],
    /// Derived session key.
    pub session_key: SessionKey,
}

fn blob_nonce(ephemeral_pub: &[u8; PUBKEY_LEN]) -> Result<[u8; NONCE_LEN], ProtocolError> {
    let full = kdf(ephemeral_pub, KEY_LEN)?;
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&full[..NONCE_LEN]);
    Ok(nonce)
}

fn seal_credentials(
    ephemeral_pub: &[u8; PUBKEY_LEN],
    local: &LocalIdentity,
) -> Result<Vec<u8>, ProtocolError> {
    let blob = CertBlob {
        static_pub: *local.keypair().public_bytes(),
        cert_der: local.identity().certificate_der.clone(),
    };
    let nonce = blob_nonce(ephemeral_pub)?;
    aead_seal(ephemeral_pub, &nonce, &blob.encode(), b"")
}

fn open_credentials(
    payload: &HandshakePayload<'_>,
    roots: &TrustRoots,
) -> Result<(Identity, [u8; PUBKEY_LEN]), ProtocolError> {
    let nonce = blob_nonce(&payload.ephemeral_pub)?;
    let plain = aead_open(&payload.ephemeral_pub, &nonce, payload.sealed, b"")?;
    let blob = CertBlob::parse(&plain)?;
    let identity = roots.verify(&blob.cert_der)?;
    Ok((identity, blob.static_pub))
}

/// Initiator side of one handshake attempt.
///
/// Holds the ephemeral secret until the RESP arrives; the INIT packet is
/// recomputed deterministically, so retransmits are byte-identical.
pub struct Initiator {
    cid: u32,
    ephemeral: EphemeralKeypair,
}

impl Initiator {
    /// Start a handshake on a freshly allocated CID.
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            ephemeral: EphemeralKeypair::generate(),
        }
    }

    /// The CID this handshake runs under.
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// Build the HANDSHAKE_INIT packet.
    pub fn init_packet(&self, local: &LocalIdentity) -> Result<Packet, ProtocolError> {
        let sealed = seal_credentials(self.ephemeral.public_bytes(), local)?;
        Packet::handshake(
            PacketType::HandshakeInit,
            self.cid,
            self.ephemeral.public_bytes(),
            &sealed,
        )
    }

    /// Consume a HANDSHAKE_RESP payload and derive the session.
    ///
    /// The shared secret is computed against the static key carried in the
    /// responder's blob; with a pinned peer the caller must additionally
    /// check that key against the pin.
    ///
    /// # Errors
    ///
    /// `AuthFailure` if the blob does not open, `UntrustedIssuer` /
    /// `MalformedPacket` from certificate verification, `CryptoFailure`
    /// for a degenerate shared secret.
    pub fn complete(
        &self,
        resp_payload: &[u8],
        roots: &TrustRoots,
    ) -> Result<PeerCredentials, ProtocolError> {
        let payload = HandshakePayload::parse(resp_payload)?;
        let (identity, static_public) = open_credentials(&payload, roots)?;
        let shared = self.ephemeral.dh(&static_public)?;
        Ok(PeerCredentials {
            identity,
            static_public,
            session_key: SessionKey::derive(&shared)?,
        })
    }
}

/// Responder output: the derived session plus the RESP packet to emit.
///
/// Callers keep `response` for the duration of the handshake and re-send
/// it for every retransmitted INIT on the same CID.
pub struct Accepted {
    /// Verified initiator identity and derived key.
    pub credentials: PeerCredentials,
    /// The HANDSHAKE_RESP packet answering this INIT.
    pub response: Packet,
}

/// Responder side: consume an INIT, produce the session and the RESP.
///
/// # Errors
///
/// `AuthFailure` if the blob does not open (dropped silently by the
/// caller), `UntrustedIssuer` / `MalformedPacket` from certificate
/// verification, `CryptoFailure` for a degenerate shared secret.
pub fn accept(
    cid: u32,
    init_payload: &[u8],
    local: &LocalIdentity,
    roots: &TrustRoots,
) -> Result<Accepted, ProtocolError> {
    let payload = HandshakePayload::parse(init_payload)?;
    let (identity, static_public) = open_credentials(&payload, roots)?;

    // Same secret as the initiator's dh(e_i, static_r_pub).
    let shared = local.keypair().dh(&payload.ephemeral_pub)?;
    let session_key = SessionKey::derive(&shared)?;

    let ephemeral = EphemeralKeypair::generate();
    let sealed = seal_credentials(ephemeral.public_bytes(), local)?;
    let response = Packet::handshake(
        PacketType::HandshakeResp,
        cid,
        ephemeral.public_bytes(),
        &sealed,
    )?;

    Ok(Accepted {
        credentials: PeerCredentials {
            identity,
            static_public,
            session_key,
        },
        response,
    })
}
