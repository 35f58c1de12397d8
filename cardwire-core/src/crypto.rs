//! Cryptographic primitives.
//!
//! Three opaque operations back the whole protocol:
//!
//! - `dh`: raw Curve25519; an all-zero shared secret is rejected
//! - `kdf`: unkeyed BLAKE2s-256, truncated to the requested length
//! - `aead_seal` / `aead_open`: ChaCha20-Poly1305 with 96-bit nonces
//!
//! The `aad` parameter is empty everywhere on the baseline wire format but
//! is kept in the signatures so the packet header can be bound later
//! without changing call sites.
//!
//! All secret material is zeroized on drop.

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::ProtocolError;
use crate::packet::{NONCE_LEN, PUBKEY_LEN};

/// Symmetric key size.
pub const KEY_LEN: usize = 32;

/// Long-lived Curve25519 keypair, one per local installation.
///
/// The secret half zeroizes on drop (via `x25519-dalek`'s `zeroize`
/// feature). Persisting the secret is the host's responsibility.
pub struct StaticKeypair {
    secret: StaticSecret,
    public: [u8; PUBKEY_LEN],
}

impl StaticKeypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Rebuild a keypair from a persisted secret.
    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Secret half, for host persistence only.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Public half.
    pub fn public_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.public
    }

    /// Curve25519 ECDH against a peer public key.
    pub fn dh(&self, peer_public: &[u8; PUBKEY_LEN]) -> Result<SharedSecret, ProtocolError> {
        dh(&self.secret, peer_public)
    }
}

/// Per-handshake Curve25519 keypair.
///
/// Backed by a `StaticSecret` rather than `EphemeralSecret` because the
/// responder must hold its key stable for the duration of one handshake
/// (retransmitted HANDSHAKE_INIT packets must be answered with identical
/// bytes). Dropped, and thereby zeroized, as soon as the session key is
/// derived.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: [u8; PUBKEY_LEN],
}

impl EphemeralKeypair {
    /// Generate a fresh keypair for one handshake attempt.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// Public half, sent in the clear and used as the blob-sealing key.
    pub fn public_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.public
    }

    /// Curve25519 ECDH against a peer public key.
    pub fn dh(&self, peer_public: &[u8; PUBKEY_LEN]) -> Result<SharedSecret, ProtocolError> {
        dh(&self.secret, peer_public)
    }
}

/// Raw ECDH output. Zeroizes on drop.
pub type SharedSecret = Zeroizing<[u8; KEY_LEN]>;

fn dh(secret: &StaticSecret, peer_public: &[u8; PUBKEY_LEN]) -> Result<SharedSecret, ProtocolError> {
    let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
    let bytes = Zeroizing::new(*shared.as_bytes());
    // All-zero output means the peer sent a low-order point.
    if bytes.iter().all(|&b| b == 0) {
        return Err(ProtocolError::CryptoFailure);
    }
    Ok(bytes)
}

/// Unkeyed BLAKE2s-256, truncated to `len` bytes (`len` <= 32).
///
/// Used for session-key derivation and for deriving the handshake blob
/// nonce from the ephemeral public key.
pub fn kdf(input: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    if len > KEY_LEN {
        return Err(ProtocolError::CryptoFailure);
    }
    let mut hasher = Blake2s256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    Ok(Zeroizing::new(digest[..len].to_vec()))
}

/// ChaCha20-Poly1305 seal. Returns ciphertext plus tag.
pub fn aead_seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| ProtocolError::CryptoFailure)
}

/// ChaCha20-Poly1305 open. Any mismatch in key, nonce, aad, or a single
/// flipped ciphertext byte yields `AuthFailure`.
pub fn aead_open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, ProtocolError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| ProtocolError::AuthFailure)
}

/// Draw a fresh 96-bit nonce from the OS CSPRNG.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Derived 256-bit session key, shared by both directions of a session.
#[derive(Clone, PartialEq, Eq, Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Derive from an ECDH shared secret: `kdf(ss, 32)`.
    pub fn derive(shared: &SharedSecret) -> Result<Self, ProtocolError> {
        let bytes = kdf(shared.as_ref(), KEY_LEN)?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Rebuild from persisted key material.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes, for sealing and for host persistence.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_symmetry() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();

        let ab = a.dh(b.public_bytes()).unwrap();
        let ba = b.dh(a.public_bytes()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_dh_rejects_low_order_point() {
        let a = StaticKeypair::generate();
        // The identity point forces an all-zero shared secret.
        assert!(matches!(
            a.dh(&[0u8; 32]),
            Err(ProtocolError::CryptoFailure)
        ));
    }

    #[test]
    fn test_kdf_lengths() {
        let full = kdf(b"input", 32).unwrap();
        let prefix = kdf(b"input", 12).unwrap();
        assert_eq!(full.len(), 32);
        assert_eq!(prefix.len(), 12);
        assert_eq!(&full[..12], &prefix[..]);
        assert_eq!(kdf(b"input", 33), Err(ProtocolError::CryptoFailure));
    }

    #[test]
    fn test_kdf_distinct_inputs() {
        assert_ne!(kdf(b"a", 32).unwrap(), kdf(b"b", 32).unwrap());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [7u8; 32];
        let nonce = random_nonce();
        let sealed = aead_seal(&key, &nonce, b"hola", b"").unwrap();
        let opened = aead_open(&key, &nonce, &sealed, b"").unwrap();
        assert_eq!(&opened[..], b"hola");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [7u8; 32];
        let nonce = random_nonce();
        let mut sealed = aead_seal(&key, &nonce, b"hola", b"").unwrap();

        for i in 0..sealed.len() {
            sealed[i] ^= 0x01;
            assert_eq!(
                aead_open(&key, &nonce, &sealed, b""),
                Err(ProtocolError::AuthFailure),
                "flipped byte {} must not authenticate",
                i
            );
            sealed[i] ^= 0x01;
        }
    }

    #[test]
    fn test_open_rejects_wrong_key_nonce_aad() {
        let key = [7u8; 32];
        let nonce = random_nonce();
        let sealed = aead_seal(&key, &nonce, b"hola", b"").unwrap();

        assert_eq!(
            aead_open(&[8u8; 32], &nonce, &sealed, b""),
            Err(ProtocolError::AuthFailure)
        );
        assert_eq!(
            aead_open(&key, &random_nonce(), &sealed, b""),
            Err(ProtocolError::AuthFailure)
        );
        assert_eq!(
            aead_open(&key, &nonce, &sealed, b"header"),
            Err(ProtocolError::AuthFailure)
        );
    }

    #[test]
    fn test_session_key_derivation_stable() {
        let a = StaticKeypair::generate();
        let b = StaticKeypair::generate();
        let k1 = SessionKey::derive(&a.dh(b.public_bytes()).unwrap()).unwrap();
        let k2 = SessionKey::derive(&b.dh(a.public_bytes()).unwrap()).unwrap();
        assert_eq!(k1, k2);
    }
}
