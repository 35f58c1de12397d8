//! Cardwire host daemon.
//!
//! Thin wrapper around the transport: load configuration, bring up the
//! card-backed identity, bind the socket, and pump UI events into the
//! log. Exit codes: 0 normal shutdown, 2 configuration error, 3 card
//! unavailable, 4 socket bind failure.
//!
//! The smartcard access layer is out of scope for this repository; this
//! host stands a file-backed card in for it. The local certificate is
//! read from `<db_path>/identity.der` and the static key from
//! `<db_path>/static.key` (generated on first run).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use cardwire_core::crypto::StaticKeypair;
use cardwire_core::{Card, LocalIdentity, ProtocolError, TrustRoots};
use cardwire_transport::config::{Config, EXIT_BIND, EXIT_CARD, EXIT_CONFIG};
use cardwire_transport::{spawn, MemoryStore, Stores, UiEvent};
use tracing::{error, info, warn};

/// File-backed stand-in for the card access layer.
///
/// A real deployment links a PKCS#11 layer here (see `pkcs_module_path`
/// in the configuration); the capability surface is identical.
struct FsCard {
    cert_path: PathBuf,
}

impl Card for FsCard {
    fn certificate(&self) -> Result<Vec<u8>, ProtocolError> {
        std::fs::read(&self.cert_path).map_err(|_| ProtocolError::CardUnavailable)
    }

    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        // Signing stays on the card; the file-backed stand-in cannot.
        Err(ProtocolError::CardUnavailable)
    }
}

fn load_or_create_keypair(path: &Path) -> std::io::Result<StaticKeypair> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let secret: [u8; 32] = bytes.try_into().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad static key length")
            })?;
            Ok(StaticKeypair::from_secret_bytes(secret))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = StaticKeypair::generate();
            std::fs::write(path, keypair.secret_bytes().as_slice())?;
            Ok(keypair)
        }
        Err(e) => Err(e),
    }
}

fn load_roots(dir: &Path) -> Vec<Vec<u8>> {
    let mut roots = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir.join("roots")) {
        for entry in entries.flatten() {
            if entry.path().extension().map(|e| e == "der").unwrap_or(false) {
                if let Ok(der) = std::fs::read(entry.path()) {
                    roots.push(der);
                }
            }
        }
    }
    roots
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = match &config_path {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::from(EXIT_CONFIG as u8);
            }
        },
        None => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(if config.debug { "debug" } else { "info" })
        .init();

    let data_dir = config
        .db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    let card: Arc<dyn Card> = Arc::new(FsCard {
        cert_path: data_dir.join("identity.der"),
    });

    let keypair = match load_or_create_keypair(&data_dir.join("static.key")) {
        Ok(keypair) => keypair,
        Err(e) => {
            error!(error = %e, "cannot load static keypair");
            return ExitCode::from(EXIT_CARD as u8);
        }
    };

    let local = match LocalIdentity::from_card(card.as_ref(), keypair) {
        Ok(local) => local,
        Err(e) => {
            error!(error = %e, "card unavailable at startup");
            return ExitCode::from(EXIT_CARD as u8);
        }
    };
    let my_name = local.identity().display_name.clone();
    info!(name = %my_name, fingerprint = %local.identity().fingerprint, "identity ready");

    let roots = match TrustRoots::new(load_roots(&data_dir)) {
        Ok(roots) => roots,
        Err(e) => {
            error!(error = %e, "bad trust root");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        contacts: store.clone(),
        messages: store.clone(),
        cache: store,
    };

    let service_name = config.discovery_service_name.clone();
    let (handle, mut events) = match spawn(config, card, local, roots, stores).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "cannot bind socket");
            return ExitCode::from(EXIT_BIND as u8);
        }
    };
    info!(addr = %handle.local_addr(), "cardwire node up");

    // The discovery layer is external; hand it what to announce.
    let advert = handle.advertisement(my_name);
    info!(service = %service_name, port = advert.own_port, hint = %advert.own_hint, "advertise");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.shutdown();
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },
        }
    }

    ExitCode::from(0)
}

fn log_event(event: UiEvent) {
    match event {
        UiEvent::NewPeer {
            fingerprint,
            display_name,
            endpoint,
        } => info!(%fingerprint, %display_name, %endpoint, "new peer pinned"),
        UiEvent::PeerConfirmed { fingerprint } => info!(%fingerprint, "peer confirmed"),
        UiEvent::UntrustedPeer { endpoint } => warn!(%endpoint, "untrusted certificate"),
        UiEvent::PinMismatch {
            endpoint,
            pinned,
            presented,
        } => warn!(%endpoint, %pinned, %presented, "PIN MISMATCH — possible impersonation"),
        UiEvent::SessionEstablished {
            cid,
            fingerprint,
            resumed,
        } => info!(cid, %fingerprint, resumed, "session established"),
        UiEvent::SessionClosed { cid, reason } => info!(cid, %reason, "session closed"),
        UiEvent::MessageReceived { from, text, .. } => info!(%from, %text, "message"),
        UiEvent::MessageDelivered { uuid } => info!(%uuid, "delivered"),
        UiEvent::MessageFailed { uuid, reason } => warn!(%uuid, %reason, "message failed"),
        UiEvent::PendingBatchStarted { cid } => info!(cid, "peer draining queued messages"),
        UiEvent::PendingBatchFinished { cid } => info!(cid, "queued messages drained"),
    }
}
