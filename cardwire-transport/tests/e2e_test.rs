//! End-to-end scenarios over loopback UDP.
//!
//! Two flavors: full node-to-node runs (dial, deliver, resume), and a
//! raw-socket harness that speaks the wire format directly against a
//! node to pin down byte-level behavior (replay, tampering, pin
//! mismatch silence).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use cardwire_core::crypto::StaticKeypair;
use cardwire_core::handshake::Initiator;
use cardwire_core::packet::{Packet, PacketType, NONCE_LEN, TAG_LEN};
use cardwire_core::record::{BoundedSet, Opened, REPLAY_WINDOW};
use cardwire_core::{record, Card, Fingerprint, LocalIdentity, ProtocolError, TrustRoots};
use cardwire_transport::node::{spawn, NodeHandle, Stores};
use cardwire_transport::store::{ContactStore, MemoryStore, MessageStore};
use cardwire_transport::{Config, UiEvent};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use uuid::Uuid;

const ROOT: &[u8] = include_bytes!("../../cardwire-core/testdata/root.der");
const ALICE: &[u8] = include_bytes!("../../cardwire-core/testdata/alice.der");
const BOB: &[u8] = include_bytes!("../../cardwire-core/testdata/bob.der");
const CAROL: &[u8] = include_bytes!("../../cardwire-core/testdata/carol.der");

struct FixtureCard(&'static [u8]);

impl Card for FixtureCard {
    fn certificate(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.0.to_vec())
    }
    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::CardUnavailable)
    }
}

struct TestNode {
    handle: NodeHandle,
    events: UnboundedReceiver<UiEvent>,
    store: Arc<MemoryStore>,
}

async fn start_node(cert: &'static [u8], idle_suspend_seconds: u64) -> TestNode {
    let config = Config {
        udp_port: 0,
        listen_ip: IpAddr::from([127, 0, 0, 1]),
        idle_suspend_seconds,
        ..Config::default()
    };
    start_node_with(cert, config).await
}

async fn start_node_with(cert: &'static [u8], config: Config) -> TestNode {
    let card: Arc<dyn Card> = Arc::new(FixtureCard(cert));
    let local = LocalIdentity::from_card(card.as_ref(), StaticKeypair::generate()).unwrap();
    let roots = TrustRoots::new(vec![ROOT.to_vec()]).unwrap();
    let store = Arc::new(MemoryStore::new());
    let stores = Stores {
        contacts: store.clone(),
        messages: store.clone(),
        cache: store.clone(),
    };

    let (handle, events) = spawn(config, card, local, roots, stores).await.unwrap();
    TestNode {
        handle,
        events,
        store,
    }
}

async fn next_event<F, T>(events: &mut UnboundedReceiver<UiEvent>, mut matcher: F) -> T
where
    F: FnMut(UiEvent) -> Option<T>,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if let Some(found) = matcher(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn established(event: UiEvent) -> Option<(u32, Fingerprint, bool)> {
    match event {
        UiEvent::SessionEstablished {
            cid,
            fingerprint,
            resumed,
        } => Some((cid, fingerprint, resumed)),
        _ => None,
    }
}

#[tokio::test]
async fn fresh_handshake_pins_and_establishes() {
    let mut alice = start_node(ALICE, 300).await;
    let mut bob = start_node(BOB, 300).await;

    alice.handle.dial(bob.handle.local_addr()).unwrap();

    // The responder pins the unknown initiator before establishing.
    let new_fp = next_event(&mut bob.events, |e| match e {
        UiEvent::NewPeer { fingerprint, .. } => Some(fingerprint),
        _ => None,
    })
    .await;
    assert_eq!(new_fp, Fingerprint::of_certificate(ALICE));

    let (_, bob_fp_at_alice, resumed) = next_event(&mut alice.events, established).await;
    assert!(!resumed);
    let (_, alice_fp_at_bob, _) = next_event(&mut bob.events, established).await;

    assert_eq!(bob_fp_at_alice, Fingerprint::of_certificate(BOB));
    assert_eq!(alice_fp_at_bob, Fingerprint::of_certificate(ALICE));

    // Both sides pinned each other on first sight, unconfirmed.
    let pinned = bob.store.get(&alice_fp_at_bob).unwrap();
    assert_eq!(pinned.display_name, "GARCIA LOPEZ, MARIA");
    assert!(!pinned.confirmed);
    assert!(pinned.static_public.is_some());

    bob.handle.confirm_peer(alice_fp_at_bob).unwrap();
    next_event(&mut bob.events, |e| match e {
        UiEvent::PeerConfirmed { fingerprint } if fingerprint == alice_fp_at_bob => Some(()),
        _ => None,
    })
    .await;
    assert!(bob.store.get(&alice_fp_at_bob).unwrap().confirmed);
}

#[tokio::test]
async fn message_delivery_and_ack() {
    let mut alice = start_node(ALICE, 300).await;
    let mut bob = start_node(BOB, 300).await;

    alice.handle.dial(bob.handle.local_addr()).unwrap();
    let (_, bob_fp, _) = next_event(&mut alice.events, established).await;
    next_event(&mut bob.events, established).await;

    alice.handle.send_text(bob_fp, "hola".to_string()).unwrap();

    let (uuid, text) = next_event(&mut bob.events, |e| match e {
        UiEvent::MessageReceived { uuid, text, .. } => Some((uuid, text)),
        _ => None,
    })
    .await;
    assert_eq!(text, "hola");
    let uuid = uuid.expect("message should carry a uuid");

    let delivered = next_event(&mut alice.events, |e| match e {
        UiEvent::MessageDelivered { uuid } => Some(uuid),
        _ => None,
    })
    .await;
    assert_eq!(delivered, uuid);

    // The sender's log row flipped to delivered.
    let history = alice.store.history(&bob_fp, 10);
    assert_eq!(history.len(), 1);
    assert!(history[0].delivered);
}

#[tokio::test]
async fn idle_suspend_then_resume_drains_queue() {
    let mut alice = start_node(ALICE, 1).await;
    let mut bob = start_node(BOB, 1).await;

    alice.handle.dial(bob.handle.local_addr()).unwrap();
    let (_, bob_fp, _) = next_event(&mut alice.events, established).await;
    next_event(&mut bob.events, established).await;

    alice.handle.send_text(bob_fp, "first".to_string()).unwrap();
    next_event(&mut alice.events, |e| match e {
        UiEvent::MessageDelivered { .. } => Some(()),
        _ => None,
    })
    .await;

    // Let both sides pass the idle threshold and suspend.
    tokio::time::sleep(Duration::from_secs(2)).await;

    alice
        .handle
        .send_text(bob_fp, "after resume".to_string())
        .unwrap();

    // Resume completes on both ends.
    let (_, _, resumed) = next_event(&mut alice.events, established).await;
    assert!(resumed);
    let (_, _, resumed) = next_event(&mut bob.events, established).await;
    assert!(resumed);

    // The queued message arrives inside PENDING markers.
    next_event(&mut bob.events, |e| match e {
        UiEvent::PendingBatchStarted { .. } => Some(()),
        _ => None,
    })
    .await;
    let text = next_event(&mut bob.events, |e| match e {
        UiEvent::MessageReceived { text, .. } => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(text, "after resume");
    next_event(&mut bob.events, |e| match e {
        UiEvent::PendingBatchFinished { .. } => Some(()),
        _ => None,
    })
    .await;

    next_event(&mut alice.events, |e| match e {
        UiEvent::MessageDelivered { .. } => Some(()),
        _ => None,
    })
    .await;
}

/// Raw-socket harness: drive a node with hand-built datagrams.
struct RawPeer {
    socket: UdpSocket,
    local: LocalIdentity,
    roots: TrustRoots,
}

impl RawPeer {
    async fn new(cert: &'static [u8]) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local =
            LocalIdentity::from_card(&FixtureCard(cert), StaticKeypair::generate()).unwrap();
        let roots = TrustRoots::new(vec![ROOT.to_vec()]).unwrap();
        Self {
            socket,
            local,
            roots,
        }
    }

    async fn send(&self, datagram: &[u8], to: SocketAddr) {
        self.socket.send_to(datagram, to).await.unwrap();
    }

    async fn recv(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        buf.truncate(len);
        buf
    }

    async fn expect_silence(&self, for_ms: u64) {
        let mut buf = vec![0u8; 4096];
        let received =
            timeout(Duration::from_millis(for_ms), self.socket.recv_from(&mut buf)).await;
        assert!(received.is_err(), "expected silence, got a datagram");
    }

    /// Discard whatever is sitting in the receive buffer.
    async fn drain_socket(&self) {
        let mut buf = vec![0u8; 4096];
        while timeout(Duration::from_millis(100), self.socket.recv_from(&mut buf))
            .await
            .is_ok()
        {}
    }
}

#[tokio::test]
async fn wire_level_session_with_replay_tamper_and_pin_mismatch() {
    let mut bob = start_node(BOB, 300).await;
    let bob_addr = bob.handle.local_addr();

    let alice = RawPeer::new(ALICE).await;

    // --- S1: fresh handshake on a chosen CID ---
    let initiator = Initiator::new(0xDEADBEEF);
    let init = initiator.init_packet(&alice.local).unwrap();
    let wire = init.encode();
    // type + cid + ephemeral + sealed cert blob
    assert!(wire.len() > 5 + 32 + TAG_LEN);
    alice.send(&wire, bob_addr).await;

    let resp = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(resp.packet_type(), PacketType::HandshakeResp);
    assert_eq!(resp.cid(), 0xDEADBEEF);

    let creds = initiator.complete(resp.payload(), &alice.roots).unwrap();
    assert_eq!(creds.identity.display_name, "PEREZ RUIZ, JUAN");

    // A retransmitted INIT is answered with the identical RESP.
    alice.send(&wire, bob_addr).await;
    let resp2 = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(resp2.encode(), resp.encode());

    // --- S2: message and ACK under the derived key ---
    let uuid = Uuid::try_parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
    let mut plain = uuid.hyphenated().to_string().into_bytes();
    plain.push(b'|');
    plain.extend_from_slice(b"hola");
    let sealed = record::seal(&creds.session_key, &plain).unwrap();
    let msg = Packet::record(PacketType::Msg, 0xDEADBEEF, sealed).unwrap();
    let msg_wire = msg.encode();
    alice.send(&msg_wire, bob_addr).await;

    let ack = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(ack.packet_type(), PacketType::Ack);
    let mut window: BoundedSet<[u8; NONCE_LEN]> = BoundedSet::new(REPLAY_WINDOW);
    let opened = record::open(&creds.session_key, ack.payload(), &mut window).unwrap();
    match opened {
        Opened::Fresh(ack_plain) => {
            assert_eq!(&ack_plain[..], uuid.hyphenated().to_string().as_bytes());
        }
        Opened::Replay => panic!("fresh ack reported as replay"),
    }
    let delivered = next_event(&mut bob.events, |e| match e {
        UiEvent::MessageReceived { uuid, text, .. } => Some((uuid, text)),
        _ => None,
    })
    .await;
    assert_eq!(delivered, (Some(uuid), "hola".to_string()));

    // --- S3: the exact datagram again is dropped, no second ACK ---
    alice.send(&msg_wire, bob_addr).await;
    alice.expect_silence(500).await;

    // --- S4: one flipped ciphertext byte fails closed, session survives ---
    let mut tampered = msg_wire.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    alice.send(&tampered, bob_addr).await;
    alice.expect_silence(500).await;

    let sealed = record::seal(&creds.session_key, &plain[..0]).unwrap();
    // An empty message still authenticates: the session was not closed.
    let probe = Packet::record(PacketType::Msg, 0xDEADBEEF, sealed).unwrap();
    alice.send(&probe.encode(), bob_addr).await;
    // Bare empty text carries no uuid, so no ACK; delivery proves liveness.
    next_event(&mut bob.events, |e| match e {
        UiEvent::MessageReceived { uuid: None, .. } => Some(()),
        _ => None,
    })
    .await;

    // --- S5: same endpoint, different certificate ---
    let carol_initiator = Initiator::new(0xC0FFEE00);
    let carol_local = {
        // Carol's certificate but sent from Alice's socket.
        LocalIdentity::from_card(&FixtureCard(CAROL), StaticKeypair::generate()).unwrap()
    };
    let carol_init = carol_initiator.init_packet(&carol_local).unwrap();
    alice.send(&carol_init.encode(), bob_addr).await;

    let (pinned, presented) = next_event(&mut bob.events, |e| match e {
        UiEvent::PinMismatch {
            pinned, presented, ..
        } => Some((pinned, presented)),
        _ => None,
    })
    .await;
    assert_eq!(pinned, Fingerprint::of_certificate(ALICE));
    assert_eq!(presented, Fingerprint::of_certificate(CAROL));
    // No reply went to the mismatching handshake.
    alice.expect_silence(500).await;

    // The prior session is undisturbed: a fresh message still round-trips.
    let uuid2 = Uuid::new_v4();
    let mut plain2 = uuid2.hyphenated().to_string().into_bytes();
    plain2.push(b'|');
    plain2.extend_from_slice(b"still here");
    let sealed2 = record::seal(&creds.session_key, &plain2).unwrap();
    let msg2 = Packet::record(PacketType::Msg, 0xDEADBEEF, sealed2).unwrap();
    alice.send(&msg2.encode(), bob_addr).await;
    let ack2 = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(ack2.packet_type(), PacketType::Ack);
}

#[tokio::test]
async fn responder_backlog_drains_after_peer_initiated_resume() {
    // Fast message retries so the responder's queue exhausts its attempts
    // and the session suspends within the test budget.
    let mut bob = start_node_with(
        BOB,
        Config {
            udp_port: 0,
            listen_ip: IpAddr::from([127, 0, 0, 1]),
            message_retry_seconds: 0.05,
            ..Config::default()
        },
    )
    .await;
    let bob_addr = bob.handle.local_addr();

    let alice = RawPeer::new(ALICE).await;

    let initiator = Initiator::new(0x0DDC1D00);
    let init = initiator.init_packet(&alice.local).unwrap();
    alice.send(&init.encode(), bob_addr).await;
    let resp = Packet::parse(&alice.recv().await).unwrap();
    let creds = initiator.complete(resp.payload(), &alice.roots).unwrap();
    next_event(&mut bob.events, established).await;

    // Bob queues a message; the peer never acks, so the retries exhaust
    // and the session suspends with the message still pending.
    bob.handle
        .send_text(
            Fingerprint::of_certificate(ALICE),
            "queued while away".to_string(),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    alice.drain_socket().await;

    // The peer resumes; its own queue is empty.
    let req = Packet::control(PacketType::ReconnectReq, 0x0DDC1D00).unwrap();
    alice.send(&req.encode(), bob_addr).await;
    let resp = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(resp.packet_type(), PacketType::ReconnectResp);
    let (_, _, resumed) = next_event(&mut bob.events, established).await;
    assert!(resumed);

    // An empty drain bracket: markers only, no messages between them.
    let send_marker = Packet::control(PacketType::PendingSend, 0x0DDC1D00).unwrap();
    let done_marker = Packet::control(PacketType::PendingDone, 0x0DDC1D00).unwrap();
    alice.send(&send_marker.encode(), bob_addr).await;
    alice.send(&done_marker.encode(), bob_addr).await;

    // Bob reciprocates with his own bracket around the queued message.
    let first = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(first.packet_type(), PacketType::PendingSend);

    let msg = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(msg.packet_type(), PacketType::Msg);
    let mut window: BoundedSet<[u8; NONCE_LEN]> = BoundedSet::new(REPLAY_WINDOW);
    match record::open(&creds.session_key, msg.payload(), &mut window).unwrap() {
        Opened::Fresh(plain) => {
            let text = std::str::from_utf8(&plain).unwrap();
            assert!(text.ends_with("|queued while away"));
        }
        Opened::Replay => panic!("fresh drain message reported as replay"),
    }

    let last = Packet::parse(&alice.recv().await).unwrap();
    assert_eq!(last.packet_type(), PacketType::PendingDone);

    next_event(&mut bob.events, |e| match e {
        UiEvent::PendingBatchStarted { .. } => Some(()),
        _ => None,
    })
    .await;
    next_event(&mut bob.events, |e| match e {
        UiEvent::PendingBatchFinished { .. } => Some(()),
        _ => None,
    })
    .await;
}

#[tokio::test]
async fn untrusted_certificate_gets_no_reply() {
    let bob = start_node(BOB, 300).await;
    let bob_addr = bob.handle.local_addr();

    // A self-signed certificate outside the national roots.
    const ROGUE: &[u8] = include_bytes!("../../cardwire-core/testdata/rogue.der");
    let rogue = RawPeer::new(ROGUE).await;

    let initiator = Initiator::new(0xBADBAD00);
    let init = initiator.init_packet(&rogue.local).unwrap();
    rogue.send(&init.encode(), bob_addr).await;
    rogue.expect_silence(500).await;
}
