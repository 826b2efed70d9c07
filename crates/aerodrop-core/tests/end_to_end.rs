//! Two or three devices meeting in a room, negotiating a direct link and
//! exchanging messages and files, driven only through the public handles.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use aerodrop_core::adapters::files::MemoryFile;
use aerodrop_core::adapters::loopback::LoopbackConnector;
use aerodrop_core::adapters::memory_relay::MemoryBroker;
use aerodrop_core::adapters::quic::client::QuicRelayTransport;
use aerodrop_core::adapters::quic::server::QuicRelayBroker;
use aerodrop_core::application::negotiation::{DirectLink, Role};
use aerodrop_core::application::ports::RelayTransport;
use aerodrop_core::application::transfer::Direction;
use aerodrop_core::config::CipherConfig;
use aerodrop_core::domain::presence::Peer;
use aerodrop_core::{
    AerodropError, Identity, PeeringConfig, PeeringEvent, PeeringHandle, PeeringSession,
    PeeringState, RoomKey, SignalingClient, SignalingConfig, SignalingEvent, SignalingHandle,
};

const WAIT: Duration = Duration::from_secs(30);

fn config(name: &str) -> SignalingConfig {
    SignalingConfig {
        display_name: name.into(),
        cipher: CipherConfig { kdf_iterations: 1_000 },
        ..SignalingConfig::default()
    }
}

fn room() -> RoomKey {
    RoomKey::new("R1", "😀")
}

async fn next<E, T>(events: &mut mpsc::UnboundedReceiver<E>, mut pick: impl FnMut(E) -> Option<T>) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if let Some(value) = pick(event) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

struct Device {
    handle: SignalingHandle,
    events: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl Device {
    fn start(relay: Arc<dyn RelayTransport>, connector: &LoopbackConnector, name: &str) -> Self {
        let (handle, events) =
            SignalingClient::spawn(relay, Arc::new(connector.clone()), config(name)).unwrap();
        Self { handle, events }
    }

    fn id(&self) -> Identity {
        self.handle.id().clone()
    }

    async fn wait_for_peers(&mut self, count: usize) -> Vec<Peer> {
        next(&mut self.events, |event| match event {
            SignalingEvent::PeersChanged(peers) if peers.len() == count => Some(peers),
            _ => None,
        })
        .await
    }

    async fn incoming(&mut self) -> DirectLink {
        next(&mut self.events, |event| match event {
            SignalingEvent::IncomingPeering(link) => Some(link),
            _ => None,
        })
        .await
    }
}

/// Two devices in the same room that can see each other.
async fn pair_in_room(broker: &MemoryBroker, connector: &LoopbackConnector) -> (Device, Device) {
    let mut a = Device::start(broker.connect(), connector, "Alpha");
    let mut b = Device::start(broker.connect(), connector, "Bravo");
    a.handle.join_room(room()).await.unwrap();
    b.handle.join_room(room()).await.unwrap();
    a.wait_for_peers(1).await;
    b.wait_for_peers(1).await;
    (a, b)
}

type Session = (PeeringHandle, mpsc::UnboundedReceiver<PeeringEvent>);

/// `a` requests `b`; both links are handed to peering sessions.
async fn peer_up(a: &mut Device, b: &mut Device) -> (Session, Session) {
    let a_link = a.handle.request_peer(b.id()).await.unwrap();
    let b_link = b.incoming().await;
    assert_eq!(a_link.peer, b.id());
    assert_eq!(b_link.peer, a.id());
    (
        PeeringSession::spawn(a_link, PeeringConfig::default()),
        PeeringSession::spawn(b_link, PeeringConfig::default()),
    )
}

#[tokio::test]
async fn devices_meet_talk_and_share_a_file() {
    let broker = MemoryBroker::new();
    let connector = LoopbackConnector::new();
    let (mut a, mut b) = pair_in_room(&broker, &connector).await;
    assert_eq!(a.handle.peers().await.unwrap()[0].name, "Bravo");

    let ((alpha, mut alpha_events), (bravo, mut bravo_events)) = peer_up(&mut a, &mut b).await;
    assert_eq!(*alpha.peer(), b.id());

    // Both signaling clients released the relay after the handoff.
    next(&mut a.events, |e| matches!(e, SignalingEvent::Closed).then_some(())).await;
    next(&mut b.events, |e| matches!(e, SignalingEvent::Closed).then_some(())).await;

    alpha.send_message("hi").await.unwrap();
    let message = next(&mut bravo_events, |e| match e {
        PeeringEvent::Message(m) => Some(m),
        _ => None,
    })
    .await;
    assert_eq!(message, "hi");

    let data: Vec<u8> = (0..50_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let file_id = alpha
        .offer_file(Arc::new(MemoryFile::new("photo.jpg", "image/jpeg", data.clone())))
        .await
        .unwrap();
    let offered = next(&mut bravo_events, |e| match e {
        PeeringEvent::FileOffered(file) => Some(file),
        _ => None,
    })
    .await;
    assert_eq!(offered.id, file_id);
    assert_eq!(offered.metadata.mime_type, "image/jpeg");

    bravo.accept_file(&file_id).await.unwrap();
    let mut progress = bravo.watch_progress(&file_id).await.unwrap().unwrap();
    let (metadata, received) = next(&mut bravo_events, |e| match e {
        PeeringEvent::FileReceived { metadata, data, .. } => Some((metadata, data)),
        _ => None,
    })
    .await;
    assert_eq!(metadata.size, 50_000);
    assert_eq!(received.as_ref(), data.as_slice());
    progress.wait_for(|p| *p == 100).await.unwrap();

    next(&mut alpha_events, |e| match e {
        PeeringEvent::TransferCompleted {
            file_id: done,
            direction: Direction::Upload,
        } => Some(done),
        _ => None,
    })
    .await;

    bravo.close().await;
    next(&mut alpha_events, |e| {
        matches!(e, PeeringEvent::StateChanged(PeeringState::Disconnected)).then_some(())
    })
    .await;
}

#[tokio::test]
async fn second_request_while_negotiating_is_refused() {
    let broker = MemoryBroker::new();
    let connector = LoopbackConnector::new();
    let (a, b) = pair_in_room(&broker, &connector).await;

    let (first, second) = tokio::join!(
        a.handle.request_peer(b.id()),
        a.handle.request_peer(b.id()),
    );
    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert_eq!(
        err.downcast_ref::<AerodropError>(),
        Some(&AerodropError::NegotiationBusy { peer: b.id() })
    );
}

#[tokio::test]
async fn mutual_requests_settle_on_one_link() {
    let broker = MemoryBroker::new();
    let connector = LoopbackConnector::new();
    let (a, b) = pair_in_room(&broker, &connector).await;

    let (a_link, b_link) = tokio::join!(
        a.handle.request_peer(b.id()),
        b.handle.request_peer(a.id()),
    );
    let (a_link, b_link) = (a_link.unwrap(), b_link.unwrap());
    let (expected_a, expected_b) = if a.id() < b.id() {
        (Role::Initiator, Role::Responder)
    } else {
        (Role::Responder, Role::Initiator)
    };
    assert_eq!(a_link.role, expected_a);
    assert_eq!(b_link.role, expected_b);
}

#[tokio::test(start_paused = true)]
async fn linked_devices_stop_answering_the_room() {
    let broker = MemoryBroker::new();
    let connector = LoopbackConnector::new();
    let mut a = Device::start(broker.connect(), &connector, "Alpha");
    let mut b = Device::start(broker.connect(), &connector, "Bravo");
    let mut c = Device::start(broker.connect(), &connector, "Charlie");
    for device in [&a, &b, &c] {
        device.handle.join_room(room()).await.unwrap();
    }
    a.wait_for_peers(2).await;
    b.wait_for_peers(2).await;
    c.wait_for_peers(2).await;

    // Once a and b are linked, both have left the room for good.
    let _link = a.handle.request_peer(b.id()).await.unwrap();
    let _incoming = b.incoming().await;
    c.wait_for_peers(0).await;

    let err = c.handle.request_peer(b.id()).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<AerodropError>(),
        Some(&AerodropError::NegotiationTimeout { peer: b.id() })
    );
}

#[tokio::test]
async fn wrong_passkey_sees_nobody() {
    let broker = MemoryBroker::new();
    let connector = LoopbackConnector::new();
    let mut a = Device::start(broker.connect(), &connector, "Alpha");
    let b = Device::start(broker.connect(), &connector, "Bravo");
    a.handle.join_room(room()).await.unwrap();
    b.handle.join_room(RoomKey::new("R1", "🙃")).await.unwrap();

    let mut c = Device::start(broker.connect(), &connector, "Charlie");
    c.handle.join_room(room()).await.unwrap();

    // b shares the topic but cannot open anything sealed with the other key.
    let peers = c.wait_for_peers(1).await;
    assert_eq!(peers[0].id, a.id());
    a.wait_for_peers(1).await;
    assert!(b.handle.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn discovery_works_over_the_quic_relay() {
    let relay_broker = Arc::new(QuicRelayBroker::new("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = relay_broker.local_addr().unwrap();
    tokio::spawn(Arc::clone(&relay_broker).run());
    let connector = LoopbackConnector::new();

    let a_relay = QuicRelayTransport::connect(addr, "localhost").await.unwrap();
    let b_relay = QuicRelayTransport::connect(addr, "localhost").await.unwrap();
    let mut a = Device::start(a_relay, &connector, "Alpha");
    let mut b = Device::start(b_relay, &connector, "Bravo");
    a.handle.join_room(room()).await.unwrap();
    b.handle.join_room(room()).await.unwrap();

    let peers = a.wait_for_peers(1).await;
    assert_eq!(peers[0].name, "Bravo");
    b.wait_for_peers(1).await;

    let ((alpha, _alpha_events), (_bravo, mut bravo_events)) = peer_up(&mut a, &mut b).await;
    alpha.send_message("over quic").await.unwrap();
    let message = next(&mut bravo_events, |e| match e {
        PeeringEvent::Message(m) => Some(m),
        _ => None,
    })
    .await;
    assert_eq!(message, "over quic");
}
