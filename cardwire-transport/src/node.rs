//! UDP demultiplexer and node event loop.
//!
//! One socket, many peers. Every inbound datagram is parsed and routed by
//! type and CID to the owning session; every state change funnels through
//! the single event-loop task, so no session is ever entered by two tasks
//! at once. The loop multiplexes three sources: the socket, a command
//! channel from the embedding host, and a coarse timer tick that drives
//! handshake retransmission, message retries, idle suspension, and resume
//! fallback.
//!
//! # Silence policy
//!
//! Unsolicited packets that fail to parse or authenticate are dropped
//! without any reply. The node never emits a packet to an unknown peer in
//! response to invalid input; such drops are only counted.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use cardwire_core::handshake::{self, Initiator, PeerCredentials};
use cardwire_core::packet::MAX_DATAGRAM_LEN;
use cardwire_core::record::Opened;
use cardwire_core::session::PendingMessage;
use cardwire_core::{
    Card, Fingerprint, Identity, LocalIdentity, Packet, PacketType, ProtocolError, Role, Session,
    SessionState, TrustRoots,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{Advertisement, PeerHint};
use crate::error::TransportError;
use crate::events::{CloseReason, UiEvent};
use crate::pipeline::{
    backoff, decode_ack, decode_plaintext, encode_ack, encode_plaintext, MAX_HANDSHAKE_ATTEMPTS,
    MAX_SEND_ATTEMPTS,
};
use crate::store::{
    ContactRecord, ContactStore, Direction, MessageRecord, MessageStore, SessionCache,
};
use crate::table::SessionTable;

/// How often the timer pass runs.
const TICK: std::time::Duration = std::time::Duration::from_millis(250);

/// The persistence gateway handed to the node.
#[derive(Clone)]
pub struct Stores {
    /// Pinned contacts.
    pub contacts: Arc<dyn ContactStore>,
    /// Message log.
    pub messages: Arc<dyn MessageStore>,
    /// Cached session keys.
    pub cache: Arc<dyn SessionCache>,
}

/// Commands accepted from the embedding host.
#[derive(Debug)]
enum Command {
    Dial { endpoint: SocketAddr },
    SendText { peer: Fingerprint, text: String },
    ConfirmPeer { peer: Fingerprint },
    CloseSession { cid: u32 },
    Shutdown,
}

/// Handle to a running node.
///
/// Cheap to clone; all methods enqueue onto the node's command channel.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
}

impl NodeHandle {
    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open (or resume) a session to an endpoint.
    pub fn dial(&self, endpoint: SocketAddr) -> Result<(), TransportError> {
        self.send(Command::Dial { endpoint })
    }

    /// Dial the endpoint a discovery hint points at. The hint itself is
    /// untrusted; identity comes from the handshake.
    pub fn dial_hint(&self, hint: &PeerHint) -> Result<(), TransportError> {
        self.dial(hint.endpoint())
    }

    /// The advertisement the host should hand to the discovery service.
    pub fn advertisement(&self, own_hint: String) -> Advertisement {
        Advertisement {
            own_port: self.local_addr.port(),
            own_hint,
        }
    }

    /// Send a text message to a pinned peer.
    pub fn send_text(&self, peer: Fingerprint, text: String) -> Result<(), TransportError> {
        self.send(Command::SendText { peer, text })
    }

    /// Confirm a peer pinned on first sight.
    pub fn confirm_peer(&self, peer: Fingerprint) -> Result<(), TransportError> {
        self.send(Command::ConfirmPeer { peer })
    }

    /// Close a session by CID.
    pub fn close_session(&self, cid: u32) -> Result<(), TransportError> {
        self.send(Command::CloseSession { cid })
    }

    /// Stop the node. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::NodeStopped)
    }
}

/// Bind the socket and start the node event loop.
///
/// Returns the command handle and the UI event stream.
///
/// # Errors
///
/// `Bind` if the UDP socket cannot be bound (the host maps this to its
/// bind-failure exit code).
pub async fn spawn(
    config: Config,
    card: Arc<dyn Card>,
    local: LocalIdentity,
    roots: TrustRoots,
    stores: Stores,
) -> Result<(NodeHandle, mpsc::UnboundedReceiver<UiEvent>), TransportError> {
    let bind_addr = SocketAddr::new(config.listen_ip, config.udp_port);
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| TransportError::Bind(e.to_string()))?;
    let local_addr = socket
        .local_addr()
        .map_err(|e| TransportError::Bind(e.to_string()))?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let node = Node {
        socket: Arc::new(socket),
        config,
        card,
        local,
        roots,
        stores,
        events: event_tx,
        table: SessionTable::new(),
        warned_endpoints: HashSet::new(),
        telemetry: Telemetry::default(),
    };

    info!(%local_addr, "node listening");
    tokio::spawn(node.run(command_rx));

    Ok((
        NodeHandle {
            commands: command_tx,
            local_addr,
        },
        event_rx,
    ))
}

#[derive(Debug, Default)]
struct Telemetry {
    malformed: u64,
    auth_failures: u64,
    untrusted: u64,
    pin_mismatches: u64,
    replays: u64,
    duplicates: u64,
    unknown_session: u64,
    dropped: u64,
}

enum Tofu {
    Known,
    New,
    Mismatch { pinned: Fingerprint },
}

enum TickAction {
    RetransmitInit(u32),
    HandshakeExpired(u32),
    ResumeFallback(u32),
    IdleSuspend(u32),
    RetryMessages(u32),
    RetriesExhausted(u32),
}

struct Node {
    socket: Arc<UdpSocket>,
    config: Config,
    card: Arc<dyn Card>,
    local: LocalIdentity,
    roots: TrustRoots,
    stores: Stores,
    events: mpsc::UnboundedSender<UiEvent>,
    table: SessionTable,
    /// Endpoints already warned about untrusted certificates.
    warned_endpoints: HashSet<SocketAddr>,
    telemetry: Telemetry,
}

impl Node {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let socket = Arc::clone(&self.socket);
        // One byte over the limit so oversized datagrams fail the parse
        // instead of being silently truncated into validity.
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => self.on_datagram(&buf[..len], addr).await,
                    Err(e) => warn!(error = %e, "socket receive failed"),
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        for cid in self.table.cids() {
            if let Some(mut session) = self.table.remove(cid) {
                session.close();
                self.emit(UiEvent::SessionClosed {
                    cid,
                    reason: CloseReason::Shutdown,
                });
            }
        }
        debug!(telemetry = ?self.telemetry, "node stopped");
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.events.send(event);
    }

    async fn send_packet(&self, packet: &Packet, endpoint: SocketAddr) {
        // OS buffer pressure is transient; the retry timers cover losses.
        if let Err(e) = self.socket.send_to(&packet.encode(), endpoint).await {
            warn!(%endpoint, error = %e, "socket send failed");
        }
    }

    // ---- inbound routing -------------------------------------------------

    async fn on_datagram(&mut self, datagram: &[u8], addr: SocketAddr) {
        let packet = match Packet::parse(datagram) {
            Ok(packet) => packet,
            Err(_) => {
                self.telemetry.malformed += 1;
                return;
            }
        };

        match packet.packet_type() {
            PacketType::HandshakeInit => self.on_handshake_init(packet, addr).await,
            PacketType::HandshakeResp => self.on_handshake_resp(packet, addr).await,
            PacketType::Msg => self.on_msg(packet, addr).await,
            PacketType::Ack => self.on_ack(packet, addr).await,
            PacketType::ReconnectReq => self.on_reconnect_req(packet, addr).await,
            PacketType::ReconnectResp => self.on_reconnect_resp(packet).await,
            PacketType::PendingSend => self.on_pending_send(packet),
            PacketType::PendingDone => self.on_pending_done(packet).await,
        }
    }

    async fn on_handshake_init(&mut self, packet: Packet, addr: SocketAddr) {
        let cid = packet.cid();

        // A known CID from the same endpoint is a retransmit; answer it
        // with the identical cached RESP.
        if let Some(session) = self.table.get(cid) {
            if session.peer_endpoint == addr {
                if let Some(resp) = session.cached_resp.clone() {
                    self.send_packet(&resp, addr).await;
                    return;
                }
            }
            self.telemetry.dropped += 1;
            return;
        }

        let accepted = match handshake::accept(cid, packet.payload(), &self.local, &self.roots) {
            Ok(accepted) => accepted,
            Err(ProtocolError::UntrustedIssuer) => {
                self.telemetry.untrusted += 1;
                self.warn_untrusted(addr);
                return;
            }
            Err(_) => {
                self.telemetry.auth_failures += 1;
                return;
            }
        };

        let presented = accepted.credentials.identity.fingerprint;
        match self.apply_tofu(&accepted.credentials, addr) {
            Tofu::Mismatch { pinned } => {
                self.telemetry.pin_mismatches += 1;
                warn!(%addr, %pinned, %presented, "pin mismatch on inbound handshake");
                self.emit(UiEvent::PinMismatch {
                    endpoint: addr,
                    pinned,
                    presented,
                });
            }
            tofu => {
                let new_peer = matches!(tofu, Tofu::New);
                for old in self.table.superseded_by(&presented, Role::Responder, cid) {
                    self.close_now(old, CloseReason::Superseded);
                }

                let PeerCredentials {
                    identity,
                    static_public,
                    session_key,
                } = accepted.credentials;
                let display_name = identity.display_name.clone();

                let mut session = Session::new_responder(cid, addr);
                session.unconfirmed = new_peer;
                if session
                    .establish(identity, static_public, session_key.clone())
                    .is_err()
                {
                    return;
                }
                session.cached_resp = Some(accepted.response.clone());
                self.table.insert(session);

                self.stores
                    .cache
                    .save(&presented, cid, &session_key, SystemTime::now());

                self.send_packet(&accepted.response, addr).await;

                if new_peer {
                    self.emit(UiEvent::NewPeer {
                        fingerprint: presented,
                        display_name,
                        endpoint: addr,
                    });
                }
                self.emit(UiEvent::SessionEstablished {
                    cid,
                    fingerprint: presented,
                    resumed: false,
                });
            }
        }
    }

    async fn on_handshake_resp(&mut self, packet: Packet, addr: SocketAddr) {
        let cid = packet.cid();

        let completed = {
            let Some(session) = self.table.get_mut(cid) else {
                self.telemetry.unknown_session += 1;
                return;
            };
            if session.state() != SessionState::Handshaking {
                self.telemetry.dropped += 1;
                return;
            }
            let Some(hs) = session.initiator_hs.as_ref() else {
                self.telemetry.dropped += 1;
                return;
            };
            hs.complete(packet.payload(), &self.roots)
        };

        let credentials = match completed {
            Ok(credentials) => credentials,
            Err(ProtocolError::UntrustedIssuer) => {
                self.telemetry.untrusted += 1;
                self.warn_untrusted(addr);
                return;
            }
            Err(_) => {
                self.telemetry.auth_failures += 1;
                return;
            }
        };

        let presented = credentials.identity.fingerprint;
        match self.apply_tofu(&credentials, addr) {
            Tofu::Mismatch { pinned } => {
                self.telemetry.pin_mismatches += 1;
                warn!(%addr, %pinned, %presented, "pin mismatch on handshake response");
                self.emit(UiEvent::PinMismatch {
                    endpoint: addr,
                    pinned,
                    presented,
                });
                self.close_now(cid, CloseReason::PinMismatch);
            }
            tofu => {
                let new_peer = matches!(tofu, Tofu::New);
                for old in self.table.superseded_by(&presented, Role::Initiator, cid) {
                    self.close_now(old, CloseReason::Superseded);
                }

                let session_key = credentials.session_key.clone();
                let display_name = credentials.identity.display_name.clone();
                {
                    let Some(session) = self.table.get_mut(cid) else {
                        return;
                    };
                    session.unconfirmed = new_peer;
                    session.peer_endpoint = addr;
                    if session
                        .establish(
                            credentials.identity,
                            credentials.static_public,
                            credentials.session_key,
                        )
                        .is_err()
                    {
                        return;
                    }
                }

                self.stores
                    .cache
                    .save(&presented, cid, &session_key, SystemTime::now());

                if new_peer {
                    self.emit(UiEvent::NewPeer {
                        fingerprint: presented,
                        display_name,
                        endpoint: addr,
                    });
                }
                self.emit(UiEvent::SessionEstablished {
                    cid,
                    fingerprint: presented,
                    resumed: false,
                });

                // Messages queued while the handshake was in flight.
                self.transmit_due(cid).await;
            }
        }
    }

    async fn on_msg(&mut self, packet: Packet, addr: SocketAddr) {
        let cid = packet.cid();
        let (opened, was_suspended) = {
            let Some(session) = self.table.get_mut(cid) else {
                self.telemetry.unknown_session += 1;
                return;
            };
            let was_suspended = session.state() == SessionState::Suspended;
            (session.open_record(packet.payload()), was_suspended)
        };

        let plain = match opened {
            Ok(Opened::Fresh(plain)) => plain,
            Ok(Opened::Replay) => {
                self.telemetry.replays += 1;
                return;
            }
            Err(ProtocolError::AuthFailure) => {
                self.telemetry.auth_failures += 1;
                self.note_decrypt_failure(cid);
                return;
            }
            Err(_) => {
                self.telemetry.malformed += 1;
                return;
            }
        };

        // A first successful decrypt on a Suspended session is an
        // implicit resume.
        if was_suspended {
            self.refresh_retry_budget(cid);
        }

        // Only authenticated traffic may move the session's endpoint.
        let from = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            session.peer_endpoint = addr;
            match session.peer_identity() {
                Some(identity) => identity.fingerprint,
                None => return,
            }
        };

        let (uuid, text) = match decode_plaintext(&plain) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.telemetry.malformed += 1;
                return;
            }
        };

        let Some(uuid) = uuid else {
            // Bare text: deliver, but nothing to ack or deduplicate.
            self.emit(UiEvent::MessageReceived {
                cid,
                from,
                uuid: None,
                text,
            });
            return;
        };

        {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            if !session.seen_uuids.insert(uuid) {
                // Duplicate delivery attempt: no event, no second ACK.
                self.telemetry.duplicates += 1;
                return;
            }
        }

        // Persist before acknowledging; a crash here must not have acked.
        self.stores.messages.append(MessageRecord {
            session_cid: cid,
            direction: Direction::Inbound,
            uuid,
            text: text.clone(),
            timestamp: SystemTime::now(),
            delivered: true,
        });

        let ack = {
            let Some(session) = self.table.get(cid) else {
                return;
            };
            match session
                .seal_record(&encode_ack(&uuid))
                .and_then(|sealed| Packet::record(PacketType::Ack, cid, sealed))
            {
                Ok(ack) => ack,
                Err(_) => return,
            }
        };
        self.send_packet(&ack, addr).await;

        self.emit(UiEvent::MessageReceived {
            cid,
            from,
            uuid: Some(uuid),
            text,
        });
    }

    async fn on_ack(&mut self, packet: Packet, _addr: SocketAddr) {
        let cid = packet.cid();
        let (opened, was_suspended) = {
            let Some(session) = self.table.get_mut(cid) else {
                self.telemetry.unknown_session += 1;
                return;
            };
            let was_suspended = session.state() == SessionState::Suspended;
            (session.open_record(packet.payload()), was_suspended)
        };

        let plain = match opened {
            Ok(Opened::Fresh(plain)) => plain,
            Ok(Opened::Replay) => {
                self.telemetry.replays += 1;
                return;
            }
            Err(ProtocolError::AuthFailure) => {
                self.telemetry.auth_failures += 1;
                self.note_decrypt_failure(cid);
                return;
            }
            Err(_) => {
                self.telemetry.malformed += 1;
                return;
            }
        };

        if was_suspended {
            self.refresh_retry_budget(cid);
        }

        let Ok(uuid) = decode_ack(&plain) else {
            self.telemetry.malformed += 1;
            return;
        };

        let acked = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            let before = session.pending_outbound.len();
            session.pending_outbound.retain(|m| m.uuid != uuid);
            before != session.pending_outbound.len()
        };

        if acked {
            self.stores.messages.mark_delivered(&uuid);
            self.emit(UiEvent::MessageDelivered { uuid });
        }
    }

    async fn on_reconnect_req(&mut self, packet: Packet, addr: SocketAddr) {
        let cid = packet.cid();

        if let Some(session) = self.table.get_mut(cid) {
            if session.state() == SessionState::Suspended && session.session_key().is_some() {
                let _ = session.promote();
                let fingerprint = session.peer_identity().map(|i| i.fingerprint);
                self.refresh_retry_budget(cid);
                if let Ok(resp) = Packet::control(PacketType::ReconnectResp, cid) {
                    self.send_packet(&resp, addr).await;
                }
                if let Some(fingerprint) = fingerprint {
                    self.emit(UiEvent::SessionEstablished {
                        cid,
                        fingerprint,
                        resumed: true,
                    });
                }
            } else {
                self.telemetry.dropped += 1;
            }
            return;
        }

        // The session may predate this process; rebuild it from the cache.
        let Some(contact) = self.stores.contacts.find_by_endpoint(addr) else {
            self.telemetry.unknown_session += 1;
            return;
        };
        let Some((cached_cid, key)) = self.stores.cache.load(&contact.fingerprint) else {
            self.telemetry.unknown_session += 1;
            return;
        };
        let Some(certificate_der) = contact.certificate_der else {
            self.telemetry.unknown_session += 1;
            return;
        };
        if cached_cid != cid {
            self.telemetry.dropped += 1;
            return;
        }

        let identity = Identity {
            certificate_der,
            fingerprint: contact.fingerprint,
            display_name: contact.display_name,
        };
        let mut session = Session::new_resuming(cid, addr, Role::Responder, identity, key);
        let _ = session.promote();
        self.table.insert(session);

        if let Ok(resp) = Packet::control(PacketType::ReconnectResp, cid) {
            self.send_packet(&resp, addr).await;
        }
        self.emit(UiEvent::SessionEstablished {
            cid,
            fingerprint: contact.fingerprint,
            resumed: true,
        });
    }

    async fn on_reconnect_resp(&mut self, packet: Packet) {
        let cid = packet.cid();
        let resumed = {
            let Some(session) = self.table.get_mut(cid) else {
                self.telemetry.unknown_session += 1;
                return;
            };
            if session.state() == SessionState::Suspended && session.resume_deadline.is_some() {
                let _ = session.promote();
                session.peer_identity().map(|i| i.fingerprint)
            } else {
                self.telemetry.dropped += 1;
                None
            }
        };

        if let Some(fingerprint) = resumed {
            self.refresh_retry_budget(cid);
            self.emit(UiEvent::SessionEstablished {
                cid,
                fingerprint,
                resumed: true,
            });
            self.drain_queue(cid).await;
        }
    }

    fn on_pending_send(&mut self, packet: Packet) {
        let cid = packet.cid();
        if self.table.get(cid).is_some() {
            self.emit(UiEvent::PendingBatchStarted { cid });
        } else {
            self.telemetry.unknown_session += 1;
        }
    }

    async fn on_pending_done(&mut self, packet: Packet) {
        let cid = packet.cid();
        let reciprocate = {
            let Some(session) = self.table.get_mut(cid) else {
                self.telemetry.unknown_session += 1;
                return;
            };
            session.state() == SessionState::Established
                && !session.drained_since_resume
                && !session.pending_outbound.is_empty()
        };

        self.emit(UiEvent::PendingBatchFinished { cid });

        // The peer finished its burst; answer with our own backlog once.
        if reciprocate {
            self.drain_queue(cid).await;
        }
    }

    // ---- identity checks -------------------------------------------------

    fn warn_untrusted(&mut self, endpoint: SocketAddr) {
        if self.warned_endpoints.insert(endpoint) {
            self.emit(UiEvent::UntrustedPeer { endpoint });
        }
    }

    /// Trust-on-first-use: pin unknown fingerprints, verify known ones.
    fn apply_tofu(&mut self, credentials: &PeerCredentials, addr: SocketAddr) -> Tofu {
        let fingerprint = credentials.identity.fingerprint;

        if let Some(contact) = self.stores.contacts.get(&fingerprint) {
            if let Some(pinned_static) = contact.static_public {
                if pinned_static != credentials.static_public {
                    return Tofu::Mismatch {
                        pinned: fingerprint,
                    };
                }
            }
            // Refresh the certificate and endpoint; the display name is
            // user-owned and left alone.
            self.stores.contacts.upsert(ContactRecord {
                fingerprint,
                display_name: contact.display_name,
                static_public: Some(credentials.static_public),
                certificate_der: Some(credentials.identity.certificate_der.clone()),
                pinned_at: contact.pinned_at,
                last_seen_endpoint: Some(addr),
                confirmed: contact.confirmed,
            });
            return Tofu::Known;
        }

        // Never accept a second identity from an endpoint that already
        // served a pinned one.
        if let Some(previous) = self.stores.contacts.find_by_endpoint(addr) {
            if previous.fingerprint != fingerprint {
                return Tofu::Mismatch {
                    pinned: previous.fingerprint,
                };
            }
        }

        self.stores.contacts.upsert(ContactRecord {
            fingerprint,
            display_name: credentials.identity.display_name.clone(),
            static_public: Some(credentials.static_public),
            certificate_der: Some(credentials.identity.certificate_der.clone()),
            pinned_at: SystemTime::now(),
            last_seen_endpoint: Some(addr),
            confirmed: false,
        });
        Tofu::New
    }

    // ---- commands --------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial { endpoint } => self.dial(endpoint).await,
            Command::SendText { peer, text } => self.send_text(peer, text).await,
            Command::ConfirmPeer { peer } => self.confirm_peer(peer),
            Command::CloseSession { cid } => self.close_now(cid, CloseReason::UserAction),
            Command::Shutdown => {}
        }
    }

    async fn dial(&mut self, endpoint: SocketAddr) {
        // The card is consulted only for handshake identity; when it is
        // gone, new outbound handshakes are blocked while established
        // sessions keep working.
        if self.card.certificate().is_err() {
            warn!(%endpoint, "card unavailable, dial refused");
            return;
        }

        if let Some(contact) = self.stores.contacts.find_by_endpoint(endpoint) {
            if let Some(cid) = self.table.find_by_fingerprint(&contact.fingerprint) {
                let state = self.table.get(cid).map(|s| s.state());
                if state == Some(SessionState::Suspended) {
                    self.request_resume(cid).await;
                }
                return;
            }

            // No live session; try the cached key before a full handshake.
            if let Some((cached_cid, key)) = self.stores.cache.load(&contact.fingerprint) {
                if self.table.get(cached_cid).is_none() {
                    if let Some(certificate_der) = contact.certificate_der {
                        let identity = Identity {
                            certificate_der,
                            fingerprint: contact.fingerprint,
                            display_name: contact.display_name,
                        };
                        let session = Session::new_resuming(
                            cached_cid,
                            endpoint,
                            Role::Initiator,
                            identity,
                            key,
                        );
                        self.table.insert(session);
                        self.request_resume(cached_cid).await;
                        return;
                    }
                }
            }
        }

        self.start_handshake(endpoint).await;
    }

    async fn start_handshake(&mut self, endpoint: SocketAddr) {
        let cid = self.table.allocate_cid();
        let hs = Initiator::new(cid);
        let init = match hs.init_packet(&self.local) {
            Ok(init) => init,
            Err(e) => {
                warn!(error = %e, "handshake start failed");
                return;
            }
        };

        let mut session = Session::new_initiator(cid, endpoint, hs);
        session.hs_attempts = 1;
        session.hs_deadline = Some(Instant::now() + self.config.handshake_timeout());
        self.table.insert(session);

        debug!(cid, %endpoint, "handshake started");
        self.send_packet(&init, endpoint).await;
    }

    async fn request_resume(&mut self, cid: u32) {
        let endpoint = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            if session.state() != SessionState::Suspended {
                return;
            }
            if session.resume_deadline.is_none() {
                session.resume_deadline = Some(Instant::now() + self.config.handshake_timeout());
            }
            session.peer_endpoint
        };

        if let Ok(req) = Packet::control(PacketType::ReconnectReq, cid) {
            self.send_packet(&req, endpoint).await;
        }
    }

    async fn send_text(&mut self, peer: Fingerprint, text: String) {
        let uuid = Uuid::new_v4();

        let cid = match self.find_session_cid(&peer) {
            Some(cid) => cid,
            None => {
                let endpoint = self
                    .stores
                    .contacts
                    .get(&peer)
                    .and_then(|c| c.last_seen_endpoint);
                let Some(endpoint) = endpoint else {
                    self.emit(UiEvent::MessageFailed {
                        uuid,
                        reason: "unknown peer".to_string(),
                    });
                    return;
                };
                self.dial(endpoint).await;
                match self.find_session_cid(&peer) {
                    Some(cid) => cid,
                    None => {
                        self.emit(UiEvent::MessageFailed {
                            uuid,
                            reason: "peer unreachable".to_string(),
                        });
                        return;
                    }
                }
            }
        };

        self.stores.messages.append(MessageRecord {
            session_cid: cid,
            direction: Direction::Outbound,
            uuid,
            text: text.clone(),
            timestamp: SystemTime::now(),
            delivered: false,
        });

        let state = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            session.pending_outbound.push_back(PendingMessage {
                uuid,
                text,
                attempts: 0,
                next_retry: Instant::now(),
            });
            session.state()
        };

        match state {
            SessionState::Established => self.transmit_due(cid).await,
            SessionState::Suspended => self.request_resume(cid).await,
            // Queued; flushed once the handshake completes.
            SessionState::Handshaking | SessionState::Closed => {}
        }
    }

    fn confirm_peer(&mut self, peer: Fingerprint) {
        if !self.stores.contacts.confirm(&peer) {
            return;
        }
        for cid in self.table.cids() {
            if let Some(session) = self.table.get_mut(cid) {
                if session.peer_identity().map(|i| i.fingerprint) == Some(peer) {
                    session.unconfirmed = false;
                }
            }
        }
        self.emit(UiEvent::PeerConfirmed { fingerprint: peer });
    }

    fn find_session_cid(&self, peer: &Fingerprint) -> Option<u32> {
        if let Some(cid) = self.table.find_by_fingerprint(peer) {
            return Some(cid);
        }
        // Dial in flight: the handshaking session has no identity yet,
        // match it by the contact's endpoint.
        let endpoint = self.stores.contacts.get(peer)?.last_seen_endpoint?;
        self.table.cids().into_iter().find(|cid| {
            self.table
                .get(*cid)
                .map(|s| {
                    s.peer_endpoint == endpoint && s.state() == SessionState::Handshaking
                })
                .unwrap_or(false)
        })
    }

    // ---- sending and queues ----------------------------------------------

    /// Transmit every pending message whose retry deadline passed.
    async fn transmit_due(&mut self, cid: u32) {
        let now = Instant::now();
        let retry_base = self.config.message_retry();

        let (endpoint, packets) = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            if session.state() != SessionState::Established {
                return;
            }

            let due: Vec<(Uuid, String)> = session
                .pending_outbound
                .iter()
                .filter(|m| m.next_retry <= now)
                .map(|m| (m.uuid, m.text.clone()))
                .collect();

            let mut packets = Vec::with_capacity(due.len());
            for (uuid, text) in &due {
                if let Ok(sealed) = session.seal_record(&encode_plaintext(uuid, text)) {
                    if let Ok(packet) = Packet::record(PacketType::Msg, cid, sealed) {
                        packets.push(packet);
                    }
                }
            }
            for message in session.pending_outbound.iter_mut() {
                if message.next_retry <= now {
                    message.attempts += 1;
                    message.next_retry =
                        now + backoff(retry_base, message.attempts.saturating_sub(1));
                }
            }
            (session.peer_endpoint, packets)
        };

        for packet in packets {
            self.send_packet(&packet, endpoint).await;
        }
    }

    /// Drain the whole queue bracketed by PENDING_SEND / PENDING_DONE so
    /// the receiver can render the burst coherently.
    ///
    /// The bracket goes out even when the queue is empty: the peer's
    /// reciprocal drain is keyed on receiving PENDING_DONE, and a resume
    /// where only the other side has a backlog must still trigger it.
    async fn drain_queue(&mut self, cid: u32) {
        let now = Instant::now();
        let retry_base = self.config.message_retry();

        let (endpoint, packets) = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            if session.state() != SessionState::Established {
                return;
            }
            session.drained_since_resume = true;

            let items: Vec<(Uuid, String)> = session
                .pending_outbound
                .iter()
                .map(|m| (m.uuid, m.text.clone()))
                .collect();

            let mut packets = Vec::with_capacity(items.len() + 2);
            if let Ok(marker) = Packet::control(PacketType::PendingSend, cid) {
                packets.push(marker);
            }
            for (uuid, text) in &items {
                if let Ok(sealed) = session.seal_record(&encode_plaintext(uuid, text)) {
                    if let Ok(packet) = Packet::record(PacketType::Msg, cid, sealed) {
                        packets.push(packet);
                    }
                }
            }
            if let Ok(marker) = Packet::control(PacketType::PendingDone, cid) {
                packets.push(marker);
            }
            for message in session.pending_outbound.iter_mut() {
                message.attempts += 1;
                message.next_retry = now + backoff(retry_base, message.attempts.saturating_sub(1));
            }
            (session.peer_endpoint, packets)
        };

        for packet in packets {
            self.send_packet(&packet, endpoint).await;
        }
    }

    /// A resumed session gets a fresh retry budget: attempts made before
    /// the suspension would otherwise trip the exhaustion check on the
    /// next tick and re-suspend it immediately.
    fn refresh_retry_budget(&mut self, cid: u32) {
        let grace = self.config.message_retry();
        let now = Instant::now();
        let Some(session) = self.table.get_mut(cid) else {
            return;
        };
        for message in session.pending_outbound.iter_mut() {
            message.attempts = 0;
            message.next_retry = now + grace;
        }
    }

    fn note_decrypt_failure(&mut self, cid: u32) {
        let close = self
            .table
            .get_mut(cid)
            .map(|s| s.note_decrypt_failure())
            .unwrap_or(false);
        if close {
            self.close_now(cid, CloseReason::AuthFailure);
        }
    }

    /// Close a session: cancel its timers, fail its queue, retire its CID.
    fn close_now(&mut self, cid: u32, reason: CloseReason) {
        let Some(mut session) = self.table.remove(cid) else {
            return;
        };
        let failed = session.close();
        for message in failed {
            self.emit(UiEvent::MessageFailed {
                uuid: message.uuid,
                reason: reason.to_string(),
            });
        }
        self.emit(UiEvent::SessionClosed { cid, reason });
    }

    // ---- timers ----------------------------------------------------------

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let idle_suspend = self.config.idle_suspend();
        let mut actions = Vec::new();

        for cid in self.table.cids() {
            let Some(session) = self.table.get(cid) else {
                continue;
            };
            match session.state() {
                SessionState::Handshaking => {
                    if let Some(deadline) = session.hs_deadline {
                        if now >= deadline {
                            if session.hs_attempts <= MAX_HANDSHAKE_ATTEMPTS {
                                actions.push(TickAction::RetransmitInit(cid));
                            } else {
                                actions.push(TickAction::HandshakeExpired(cid));
                            }
                        }
                    }
                }
                SessionState::Suspended => {
                    if let Some(deadline) = session.resume_deadline {
                        if now >= deadline {
                            actions.push(TickAction::ResumeFallback(cid));
                        }
                    }
                }
                SessionState::Established => {
                    if session.idle_for() >= idle_suspend {
                        actions.push(TickAction::IdleSuspend(cid));
                    } else if session
                        .pending_outbound
                        .iter()
                        .any(|m| m.next_retry <= now && m.attempts >= MAX_SEND_ATTEMPTS)
                    {
                        actions.push(TickAction::RetriesExhausted(cid));
                    } else if session
                        .pending_outbound
                        .iter()
                        .any(|m| m.next_retry <= now)
                    {
                        actions.push(TickAction::RetryMessages(cid));
                    }
                }
                SessionState::Closed => {}
            }
        }

        for action in actions {
            match action {
                TickAction::RetransmitInit(cid) => self.retransmit_init(cid).await,
                TickAction::HandshakeExpired(cid) => {
                    self.close_now(cid, CloseReason::HandshakeTimeout);
                }
                TickAction::ResumeFallback(cid) => self.resume_fallback(cid).await,
                TickAction::IdleSuspend(cid) => self.suspend_session(cid),
                TickAction::RetryMessages(cid) => self.transmit_due(cid).await,
                TickAction::RetriesExhausted(cid) => self.suspend_session(cid),
            }
        }
    }

    async fn retransmit_init(&mut self, cid: u32) {
        let timeout = self.config.handshake_timeout();
        let sent = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            let Some(hs) = session.initiator_hs.as_ref() else {
                return;
            };
            let Ok(init) = hs.init_packet(&self.local) else {
                return;
            };
            session.hs_attempts += 1;
            session.hs_deadline =
                Some(Instant::now() + backoff(timeout, session.hs_attempts - 1));
            Some((init, session.peer_endpoint))
        };

        if let Some((init, endpoint)) = sent {
            debug!(cid, attempt = ?self.table.get(cid).map(|s| s.hs_attempts), "handshake retransmit");
            self.send_packet(&init, endpoint).await;
        }
    }

    /// A resume went unanswered or its key failed; start over with a full
    /// handshake under a fresh CID, carrying the queue across.
    async fn resume_fallback(&mut self, cid: u32) {
        let Some(mut old) = self.table.remove(cid) else {
            return;
        };
        let endpoint = old.peer_endpoint;
        let fingerprint = old.peer_identity().map(|i| i.fingerprint);
        let pending = std::mem::take(&mut old.pending_outbound);
        old.close();
        self.emit(UiEvent::SessionClosed {
            cid,
            reason: CloseReason::HandshakeTimeout,
        });

        if let Some(fingerprint) = fingerprint {
            self.stores.cache.forget(&fingerprint);
        }

        debug!(cid, %endpoint, "resume failed, falling back to full handshake");
        self.start_handshake(endpoint).await;

        // Re-attach the queue to the replacement session.
        if let Some(new_cid) = self.table.cids().into_iter().find(|c| {
            self.table
                .get(*c)
                .map(|s| s.peer_endpoint == endpoint && s.state() == SessionState::Handshaking)
                .unwrap_or(false)
        }) {
            if let Some(session) = self.table.get_mut(new_cid) {
                session.pending_outbound = pending;
            }
        } else {
            for message in pending {
                self.emit(UiEvent::MessageFailed {
                    uuid: message.uuid,
                    reason: CloseReason::HandshakeTimeout.to_string(),
                });
            }
        }
    }

    fn suspend_session(&mut self, cid: u32) {
        let saved = {
            let Some(session) = self.table.get_mut(cid) else {
                return;
            };
            if session.suspend().is_err() {
                return;
            }
            match (session.peer_identity(), session.session_key()) {
                (Some(identity), Some(key)) => Some((identity.fingerprint, key.clone())),
                _ => None,
            }
        };

        if let Some((fingerprint, key)) = saved {
            self.stores
                .cache
                .save(&fingerprint, cid, &key, SystemTime::now());
            debug!(cid, %fingerprint, "session suspended");
        }
    }
}
