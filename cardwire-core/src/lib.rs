//! Cardwire Protocol Core
//!
//! Secure-transport core of a card-anchored peer-to-peer messenger.
//!
//! This crate provides:
//! - Wire codec for the eight packet types, with strict bounds checking
//! - Cryptographic primitives: Curve25519 DH, BLAKE2s KDF, ChaCha20-Poly1305
//! - Identity binding: card capability, trust-root verification, fingerprints
//! - The two-message IK-flavored handshake
//! - The encrypted record layer with a bounded replay window
//! - The per-peer session state machine
//!
//! # Security Invariants
//!
//! - Unauthenticated or malformed input is dropped without a reply
//! - Every Established session carries a verified, pinned peer identity
//! - Key material is zeroized on drop; plaintext buffers are `Zeroizing`
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])
//!
//! No I/O happens here; the transport crate owns the socket and timers.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod packet;
pub mod record;
pub mod session;

pub use error::ProtocolError;
pub use identity::{Card, Fingerprint, Identity, LocalIdentity, TrustRoots};
pub use packet::{Packet, PacketType};
pub use session::{Role, Session, SessionState};
