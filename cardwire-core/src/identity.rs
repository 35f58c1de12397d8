//! Identity binding.
//!
//! Ties a session to a certificate issued by the national trust anchor.
//! The card is the only holder of the private credential; this module sees
//! it through the narrow [`Card`] capability and otherwise works on DER
//! bytes: verify the chain to a configured root, hash to a fingerprint,
//! extract a printable holder name.

use std::fmt;

use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::error::ProtocolError;

/// 256-bit hash of a DER-encoded certificate.
///
/// Two certificates with the same fingerprint are the same pin.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a certificate: SHA-256 over the DER bytes.
    pub fn of_certificate(cert_der: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(cert_der);
        Self(hasher.finalize().into())
    }

    /// Rebuild from persisted bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", hex::encode(&self.0[..4]))
    }
}

/// A verified peer identity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The holder's certificate, DER-encoded.
    pub certificate_der: Vec<u8>,
    /// SHA-256 of `certificate_der`; the TOFU pin.
    pub fingerprint: Fingerprint,
    /// Holder name from the certificate CN, card-profile suffixes removed.
    pub display_name: String,
}

/// Capability handle to the smartcard.
///
/// `sign` may block for seconds while the card layer prompts for a PIN
/// and must stay off the I/O path. `certificate` is answered from the
/// card layer's cache once the card session is open, so it doubles as a
/// cheap liveness probe. A yanked card reports `CardUnavailable`, which
/// blocks new outbound handshakes but leaves established sessions
/// untouched.
pub trait Card: Send + Sync {
    /// The holder's certificate, DER-encoded.
    fn certificate(&self) -> Result<Vec<u8>, ProtocolError>;

    /// Sign arbitrary bytes with the card's private key.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

/// The configured set of national root certificates.
pub struct TrustRoots {
    roots: Vec<Vec<u8>>,
}

impl TrustRoots {
    /// Build a root set from DER certificates.
    ///
    /// # Errors
    ///
    /// `UntrustedIssuer` if any root fails to parse; a root set that cannot
    /// be used to verify anything is a configuration error.
    pub fn new(roots: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        for der in &roots {
            X509Certificate::from_der(der).map_err(|_| ProtocolError::UntrustedIssuer)?;
        }
        Ok(Self { roots })
    }

    /// Verify a received certificate and produce its identity.
    ///
    /// Checks, in order: DER well-formedness, validity dates against the
    /// local clock, issuer match against a configured root, and the
    /// certificate signature under that root's public key.
    ///
    /// # Errors
    ///
    /// `MalformedPacket` if the DER does not parse; `UntrustedIssuer` for
    /// any verification failure.
    pub fn verify(&self, cert_der: &[u8]) -> Result<Identity, ProtocolError> {
        let (_, cert) =
            X509Certificate::from_der(cert_der).map_err(|_| ProtocolError::MalformedPacket)?;

        if !cert.validity().is_valid() {
            return Err(ProtocolError::UntrustedIssuer);
        }

        for root_der in &self.roots {
            let (_, root) = X509Certificate::from_der(root_der)
                .map_err(|_| ProtocolError::UntrustedIssuer)?;
            if cert.issuer().as_raw() != root.subject().as_raw() {
                continue;
            }
            return match cert.verify_signature(Some(root.public_key())) {
                Ok(()) => Ok(identity_of(cert_der, &cert)),
                Err(_) => Err(ProtocolError::UntrustedIssuer),
            };
        }

        Err(ProtocolError::UntrustedIssuer)
    }
}

fn identity_of(cert_der: &[u8], cert: &X509Certificate<'_>) -> Identity {
    let display_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(display_name_from_cn)
        .unwrap_or_else(|| "unknown".to_string());

    Identity {
        certificate_der: cert_der.to_vec(),
        fingerprint: Fingerprint::of_certificate(cert_der),
        display_name,
    }
}

/// Strip the card-profile suffixes from a certificate CN.
///
/// National-card CNs carry a usage marker after the holder name, e.g.
/// `"GARCIA LOPEZ, MARIA (AUTENTICACIÓN)"`. The marker is noise for
/// display purposes.
pub fn display_name_from_cn(cn: &str) -> String {
    let mut name = cn.trim();
    loop {
        let Some(open) = name.rfind('(') else { break };
        let Some(inner) = name[open..].strip_prefix('(').and_then(|r| r.strip_suffix(')')) else {
            break;
        };
        let marker = inner.to_uppercase();
        if matches!(
            marker.as_str(),
            "AUTENTICACIÓN" | "AUTENTICACION" | "FIRMA"
        ) {
            name = name[..open].trim_end();
        } else {
            break;
        }
    }
    name.to_string()
}

/// The local installation's identity: static keypair plus card certificate.
///
/// The certificate is fetched once and cached for the lifetime of the card
/// session, matching how the card layer hands out credentials.
pub struct LocalIdentity {
    keypair: crate::crypto::StaticKeypair,
    identity: Identity,
}

impl LocalIdentity {
    /// Bring up the local identity from the card capability.
    ///
    /// # Errors
    ///
    /// `CardUnavailable` if the card cannot produce a usable certificate.
    pub fn from_card(
        card: &dyn Card,
        keypair: crate::crypto::StaticKeypair,
    ) -> Result<Self, ProtocolError> {
        let cert_der = card.certificate()?;
        let (_, cert) =
            X509Certificate::from_der(&cert_der).map_err(|_| ProtocolError::CardUnavailable)?;
        let identity = identity_of(&cert_der, &cert);
        Ok(Self { keypair, identity })
    }

    /// The local static keypair.
    pub fn keypair(&self) -> &crate::crypto::StaticKeypair {
        &self.keypair
    }

    /// The local identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &[u8] = include_bytes!("../testdata/root.der");
    const ALICE: &[u8] = include_bytes!("../testdata/alice.der");
    const BOB: &[u8] = include_bytes!("../testdata/bob.der");
    const ROGUE: &[u8] = include_bytes!("../testdata/rogue.der");
    const EXPIRED: &[u8] = include_bytes!("../testdata/expired.der");

    fn roots() -> TrustRoots {
        TrustRoots::new(vec![ROOT.to_vec()]).unwrap()
    }

    #[test]
    fn test_verify_accepts_chained_certificate() {
        let identity = roots().verify(ALICE).unwrap();
        assert_eq!(identity.display_name, "GARCIA LOPEZ, MARIA");
        assert_eq!(identity.fingerprint, Fingerprint::of_certificate(ALICE));
    }

    #[test]
    fn test_verify_rejects_unknown_issuer() {
        assert_eq!(roots().verify(ROGUE), Err(ProtocolError::UntrustedIssuer));
    }

    #[test]
    fn test_verify_rejects_expired_certificate() {
        assert_eq!(roots().verify(EXPIRED), Err(ProtocolError::UntrustedIssuer));
    }

    #[test]
    fn test_verify_rejects_garbage_der() {
        assert_eq!(
            roots().verify(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn test_verify_with_empty_root_set() {
        let empty = TrustRoots::new(Vec::new()).unwrap();
        assert_eq!(empty.verify(ALICE), Err(ProtocolError::UntrustedIssuer));
    }

    #[test]
    fn test_fingerprints_differ_per_certificate() {
        assert_ne!(
            Fingerprint::of_certificate(ALICE),
            Fingerprint::of_certificate(BOB)
        );
        // Stable for the same input.
        assert_eq!(
            Fingerprint::of_certificate(ALICE),
            Fingerprint::of_certificate(ALICE)
        );
    }

    #[test]
    fn test_display_name_stripping() {
        assert_eq!(
            display_name_from_cn("GARCIA LOPEZ, MARIA (AUTENTICACIÓN)"),
            "GARCIA LOPEZ, MARIA"
        );
        assert_eq!(
            display_name_from_cn("PEREZ RUIZ, JUAN (Firma)"),
            "PEREZ RUIZ, JUAN"
        );
        assert_eq!(
            display_name_from_cn("GARCIA LOPEZ, MARIA (FIRMA) (AUTENTICACION)"),
            "GARCIA LOPEZ, MARIA"
        );
        // Unrelated parentheses stay.
        assert_eq!(display_name_from_cn("ACME (S.L.)"), "ACME (S.L.)");
    }

    #[test]
    fn test_local_identity_from_card() {
        struct FixtureCard;
        impl Card for FixtureCard {
            fn certificate(&self) -> Result<Vec<u8>, ProtocolError> {
                Ok(ALICE.to_vec())
            }
            fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
                Err(ProtocolError::CardUnavailable)
            }
        }

        let local =
            LocalIdentity::from_card(&FixtureCard, crate::crypto::StaticKeypair::generate())
                .unwrap();
        assert_eq!(local.identity().display_name, "GARCIA LOPEZ, MARIA");
    }
}
