//! Signaling client actor.
//!
//! One task owns the relay connection, the [`SignalingChannel`], the
//! [`PresenceProtocol`] and the [`Negotiator`], and processes one input at a
//! time. Callers talk to it through a cloneable [`SignalingHandle`] and
//! observe it through an event receiver; dropping the receiver unsubscribes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{SignalingConfig, IDENTITY_EXPIRY};
use crate::domain::error::AerodropError;
use crate::domain::identity::{Identity, RoomKey};
use crate::domain::presence::Peer;
use crate::domain::signaling::SignalingPacket;
use crate::domain::unix_millis;

use super::negotiation::{DirectLink, NegotiationInput, Negotiator, Outcome, Role};
use super::ports::{PeerConnector, RelayEvent, RelayTransport};
use super::presence::PresenceProtocol;
use super::signaling_channel::{Inbound, SignalingChannel};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug)]
pub enum SignalingEvent {
    /// The relay connection is up.
    Connected,
    PeersChanged(Vec<Peer>),
    NegotiationStarted { peer: Identity, role: Role },
    /// A remote peer negotiated with us; hand the link to a peering session.
    IncomingPeering(DirectLink),
    NegotiationFailed { peer: Identity, error: AerodropError },
    DecryptFailed { from: Identity, error: AerodropError },
    /// Terminal for the client.
    Error(AerodropError),
    /// The client stopped and released the relay.
    Closed,
}

enum Command {
    JoinRoom {
        key: RoomKey,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    SetName {
        name: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<Peer>>,
    },
    RequestPeer {
        target: Identity,
        reply: oneshot::Sender<Result<DirectLink, AerodropError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SignalingHandle {
    id: Identity,
    commands: mpsc::Sender<Command>,
}

impl SignalingHandle {
    pub fn id(&self) -> &Identity {
        &self.id
    }

    /// Join `(roomId, passkey)`, leaving the current room first. Completes
    /// once the relay is connected and our `Hello` is out.
    pub async fn join_room(&self, key: RoomKey) -> anyhow::Result<()> {
        self.call(|reply| Command::JoinRoom { key, reply }).await?
    }

    pub async fn leave_room(&self) -> anyhow::Result<()> {
        self.call(|reply| Command::LeaveRoom { reply }).await?
    }

    /// Rename and tell the room.
    pub async fn set_name(&self, name: impl Into<String>) -> anyhow::Result<()> {
        let name = name.into();
        self.call(|reply| Command::SetName { name, reply }).await?
    }

    pub async fn peers(&self) -> anyhow::Result<Vec<Peer>> {
        self.call(|reply| Command::Peers { reply }).await
    }

    /// Negotiate a direct connection with `target`.
    ///
    /// Errors are [`AerodropError`]s: `NegotiationTimeout`,
    /// `NegotiationRejected` when the target is busy, `NegotiationBusy` when
    /// we are.
    pub async fn request_peer(&self, target: Identity) -> anyhow::Result<DirectLink> {
        Ok(self
            .call(|reply| Command::RequestPeer { target, reply })
            .await??)
    }

    /// Say goodbye to the room and stop. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| AerodropError::Closed("signaling client"))?;
        Ok(rx.await.map_err(|_| AerodropError::Closed("signaling client"))?)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Input {
    Command(Option<Command>),
    Relay(Option<RelayEvent>),
    Negotiation(NegotiationInput),
    Sweep,
    Announce,
    Idle,
}

enum Flow {
    Continue,
    Stop,
}

pub struct SignalingClient {
    config: SignalingConfig,
    relay: Arc<dyn RelayTransport>,
    relay_events: mpsc::UnboundedReceiver<RelayEvent>,
    channel: SignalingChannel,
    presence: PresenceProtocol,
    negotiator: Negotiator,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    connected: bool,
    pending_join: Option<(RoomKey, oneshot::Sender<anyhow::Result<()>>)>,
    pending_request: Option<(Identity, oneshot::Sender<Result<DirectLink, AerodropError>>)>,
    idle_deadline: Option<Instant>,
}

impl SignalingClient {
    /// Start the actor on the current runtime.
    pub fn spawn(
        relay: Arc<dyn RelayTransport>,
        connector: Arc<dyn PeerConnector>,
        config: SignalingConfig,
    ) -> anyhow::Result<(SignalingHandle, mpsc::UnboundedReceiver<SignalingEvent>)> {
        let relay_events = relay
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("relay events already taken"))?;
        let identity = match (&config.identity, &config.identity_file) {
            (Some(identity), _) => identity.clone(),
            (None, Some(path)) => Identity::load_or_create(path, IDENTITY_EXPIRY)
                .with_context(|| format!("loading identity from {}", path.display()))?,
            (None, None) => Identity::generate(),
        };
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Self {
            channel: SignalingChannel::new(
                Arc::clone(&relay),
                identity.clone(),
                &config.topic_prefix,
                config.cipher.clone(),
            ),
            presence: PresenceProtocol::new(
                identity.clone(),
                config.display_name.clone(),
                config.device,
                config.disconnect_threshold,
            ),
            negotiator: Negotiator::new(identity.clone(), connector, config.negotiation_timeout),
            idle_deadline: config.idle_timeout.map(|t| Instant::now() + t),
            config,
            relay,
            relay_events,
            commands: command_rx,
            events: event_tx,
            connected: false,
            pending_join: None,
            pending_request: None,
        };

        info!(id = %identity, "Signaling client starting");
        tokio::spawn(client.run());

        Ok((
            SignalingHandle {
                id: identity,
                commands: command_tx,
            },
            event_rx,
        ))
    }

    async fn run(mut self) {
        let mut sweep = ticker(self.config.sweep_interval);
        let mut announce = ticker(self.config.announce_interval);

        loop {
            let input = tokio::select! {
                command = self.commands.recv() => Input::Command(command),
                event = self.relay_events.recv() => Input::Relay(event),
                input = self.negotiator.next_input() => Input::Negotiation(input),
                _ = sweep.tick() => Input::Sweep,
                _ = announce.tick() => Input::Announce,
                _ = idle_sleep(self.idle_deadline) => Input::Idle,
            };
            if let Flow::Stop = self.handle(input).await {
                break;
            }
        }

        self.finish().await;
    }

    async fn handle(&mut self, input: Input) -> Flow {
        match input {
            Input::Command(None) => {
                debug!("All handles dropped");
                self.announce_leave().await;
                Flow::Stop
            }
            Input::Command(Some(command)) => {
                self.touch();
                self.on_command(command).await
            }
            Input::Relay(None) => {
                self.fail(AerodropError::transport("relay event stream ended")).await
            }
            Input::Relay(Some(event)) => self.on_relay_event(event).await,
            Input::Negotiation(input) => {
                self.touch();
                let outcome = self.negotiator.handle_input(&mut self.channel, input).await;
                self.on_outcome(outcome).await
            }
            Input::Sweep => {
                if self.presence.sweep(unix_millis()) {
                    self.emit_peers();
                }
                Flow::Continue
            }
            Input::Announce => {
                if self.channel.room().is_some() {
                    if let Err(e) = self.presence.announce_welcome(&mut self.channel).await {
                        warn!("Keep-alive announce failed: {e}");
                    }
                }
                Flow::Continue
            }
            Input::Idle => {
                if !self.negotiator.is_idle() {
                    self.touch();
                    return Flow::Continue;
                }
                warn!("Releasing relay after inactivity");
                self.announce_leave().await;
                self.emit(SignalingEvent::Error(AerodropError::transport(
                    "disconnected due to inactivity",
                )));
                Flow::Stop
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::JoinRoom { key, reply } => {
                if self.connected {
                    let result = self.join(&key).await;
                    let _ = reply.send(result);
                } else {
                    debug!(room = %key.room_id, "Join deferred until the relay connects");
                    if let Some((_, superseded)) = self.pending_join.replace((key, reply)) {
                        let _ = superseded.send(Err(AerodropError::violation(
                            "superseded by a later join",
                        )
                        .into()));
                    }
                }
            }
            Command::LeaveRoom { reply } => {
                let result = self.leave().await;
                let _ = reply.send(result);
            }
            Command::SetName { name, reply } => {
                self.presence.set_name(name);
                let result = if self.channel.room().is_some() {
                    self.presence.announce_welcome(&mut self.channel).await
                } else {
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.presence.registry().list());
            }
            Command::RequestPeer { target, reply } => {
                if self.channel.room().is_none() {
                    let _ = reply.send(Err(AerodropError::Closed("signaling room")));
                    return Flow::Continue;
                }
                match self.negotiator.request_peer(&mut self.channel, target.clone()).await {
                    Ok(()) => self.pending_request = Some((target, reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Shutdown { reply } => {
                info!("Shutting down");
                self.announce_leave().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn join(&mut self, key: &RoomKey) -> anyhow::Result<()> {
        if self.channel.room() == Some(key) {
            return Ok(());
        }
        self.announce_leave().await;
        self.channel.subscribe_room(key).await?;

        let had_peers = !self.presence.registry().is_empty();
        self.presence.reset(unix_millis());
        if had_peers {
            self.emit_peers();
        }
        self.presence.announce_hello(&mut self.channel).await?;
        info!(room = %key.room_id, topic = ?self.channel.topic(), "Joined room");
        Ok(())
    }

    async fn leave(&mut self) -> anyhow::Result<()> {
        if self.channel.room().is_none() {
            return Ok(());
        }
        self.announce_leave().await;
        self.channel.leave_room().await?;
        let had_peers = !self.presence.registry().is_empty();
        self.presence.reset(unix_millis());
        if had_peers {
            self.emit_peers();
        }
        info!("Left room");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Relay traffic
    // -----------------------------------------------------------------------

    async fn on_relay_event(&mut self, event: RelayEvent) -> Flow {
        let Some(inbound) = self.channel.handle_relay_event(event).await else {
            return Flow::Continue;
        };
        match inbound {
            Inbound::Connected => {
                info!("Relay connected");
                self.connected = true;
                self.emit(SignalingEvent::Connected);
                if let Some((key, reply)) = self.pending_join.take() {
                    let result = self.join(&key).await;
                    let _ = reply.send(result);
                }
                Flow::Continue
            }
            Inbound::Broadcast { from, data } => {
                match self
                    .presence
                    .handle_broadcast(&mut self.channel, &from, &data, unix_millis())
                    .await
                {
                    Ok(true) => self.emit_peers(),
                    Ok(false) => {}
                    Err(e) => warn!(peer = %from, "Failed to answer announcement: {e}"),
                }
                Flow::Continue
            }
            Inbound::Direct { from, data } => match SignalingPacket::decode(&data) {
                Ok(packet) => {
                    let outcome = self
                        .negotiator
                        .handle_packet(&mut self.channel, &from, packet)
                        .await;
                    self.on_outcome(outcome).await
                }
                Err(e) => {
                    warn!(peer = %from, "Dropping direct message: {e}");
                    Flow::Continue
                }
            },
            Inbound::DecryptFailed { from, error } => {
                self.emit(SignalingEvent::DecryptFailed {
                    from,
                    error: error.into(),
                });
                Flow::Continue
            }
            Inbound::TransportError(reason) => {
                // The broker refused one frame; the connection itself is fine.
                warn!(%reason, "Relay reported an error");
                Flow::Continue
            }
            Inbound::Disconnected(reason) => self.fail(AerodropError::Transport(reason)).await,
        }
    }

    async fn on_outcome(&mut self, outcome: Outcome) -> Flow {
        match outcome {
            Outcome::Pending => Flow::Continue,
            Outcome::Started { peer, role } => {
                self.emit(SignalingEvent::NegotiationStarted { peer, role });
                Flow::Continue
            }
            Outcome::Failed { peer, error } => {
                if let Some((_, reply)) = self.pending_request.take_if(|(target, _)| *target == peer) {
                    let _ = reply.send(Err(error.clone()));
                }
                self.emit(SignalingEvent::NegotiationFailed { peer, error });
                Flow::Continue
            }
            Outcome::Established(link) => {
                // The relay is no longer needed once the direct link is up.
                self.announce_leave().await;
                match self.pending_request.take_if(|(target, _)| *target == link.peer) {
                    Some((_, reply)) => {
                        if let Err(Ok(link)) = reply.send(Ok(link)) {
                            self.emit(SignalingEvent::IncomingPeering(link));
                        }
                    }
                    None => self.emit(SignalingEvent::IncomingPeering(link)),
                }
                Flow::Stop
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn fail(&mut self, error: AerodropError) -> Flow {
        error!("Signaling failed: {error}");
        let outcome = self.negotiator.abort(error.clone()).await;
        if let Outcome::Failed { peer, error } = outcome {
            if let Some((_, reply)) = self.pending_request.take() {
                let _ = reply.send(Err(error.clone()));
            }
            self.emit(SignalingEvent::NegotiationFailed { peer, error });
        }
        self.emit(SignalingEvent::Error(error));
        Flow::Stop
    }

    async fn announce_leave(&mut self) {
        if self.channel.room().is_none() {
            return;
        }
        if let Err(e) = self.presence.announce_leave(&mut self.channel).await {
            debug!("Leave announcement failed: {e}");
        }
    }

    async fn finish(mut self) {
        if let Some((_, reply)) = self.pending_request.take() {
            let _ = reply.send(Err(AerodropError::Closed("signaling client")));
        }
        if let Some((_, reply)) = self.pending_join.take() {
            let _ = reply.send(Err(AerodropError::Closed("signaling client").into()));
        }
        let _ = self.negotiator.abort(AerodropError::Closed("signaling client")).await;
        if let Err(e) = self.channel.leave_room().await {
            debug!("Unsubscribe on close failed: {e}");
        }
        self.relay.close().await;
        self.emit(SignalingEvent::Closed);
        info!(id = %self.channel.identity(), "Signaling client stopped");
    }

    fn touch(&mut self) {
        self.idle_deadline = self.config.idle_timeout.map(|t| Instant::now() + t);
    }

    fn emit_peers(&self) {
        self.emit(SignalingEvent::PeersChanged(self.presence.registry().list()));
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::loopback::LoopbackConnector;
    use crate::adapters::memory_relay::MemoryBroker;
    use crate::application::ports::{ChannelEvent, ChannelMessage};
    use crate::config::CipherConfig;

    fn config(name: &str) -> SignalingConfig {
        SignalingConfig {
            display_name: name.into(),
            topic_prefix: "TEST".into(),
            cipher: CipherConfig { kdf_iterations: 1_000 },
            ..SignalingConfig::default()
        }
    }

    struct Client {
        handle: SignalingHandle,
        events: mpsc::UnboundedReceiver<SignalingEvent>,
    }

    impl Client {
        fn start(broker: &MemoryBroker, connector: &LoopbackConnector, config: SignalingConfig) -> Self {
            let (handle, events) =
                SignalingClient::spawn(broker.connect(), Arc::new(connector.clone()), config).unwrap();
            Self { handle, events }
        }

        async fn wait_for<T>(&mut self, mut pick: impl FnMut(SignalingEvent) -> Option<T>) -> T {
            let events = &mut self.events;
            tokio::time::timeout(Duration::from_secs(600), async {
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

        async fn wait_for_peers(&mut self, count: usize) -> Vec<Peer> {
            self.wait_for(|event| match event {
                SignalingEvent::PeersChanged(peers) if peers.len() == count => Some(peers),
                _ => None,
            })
            .await
        }
    }

    fn room() -> RoomKey {
        RoomKey::new("R1", "😀")
    }

    #[tokio::test]
    async fn clients_in_a_room_discover_each_other() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Client::start(&broker, &connector, config("Alpha"));
        let mut b = Client::start(&broker, &connector, config("Bravo"));

        a.handle.join_room(room()).await.unwrap();
        b.handle.join_room(room()).await.unwrap();

        let a_peers = a.wait_for_peers(1).await;
        assert_eq!(a_peers[0].id, *b.handle.id());
        assert_eq!(a_peers[0].name, "Bravo");
        let b_peers = b.wait_for_peers(1).await;
        assert_eq!(b_peers[0].id, *a.handle.id());
        assert_eq!(b.handle.peers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rename_reaches_the_room() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Client::start(&broker, &connector, config("Alpha"));
        let mut b = Client::start(&broker, &connector, config("Bravo"));
        a.handle.join_room(room()).await.unwrap();
        b.handle.join_room(room()).await.unwrap();
        b.wait_for_peers(1).await;

        a.handle.set_name("Alpha Prime").await.unwrap();
        let renamed = b
            .wait_for(|event| match event {
                SignalingEvent::PeersChanged(peers) => {
                    peers.into_iter().find(|p| p.name == "Alpha Prime")
                }
                _ => None,
            })
            .await;
        assert_eq!(renamed.id, *a.handle.id());
    }

    #[tokio::test]
    async fn switching_rooms_leaves_the_old_one() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Client::start(&broker, &connector, config("Alpha"));
        let mut b = Client::start(&broker, &connector, config("Bravo"));
        a.handle.join_room(room()).await.unwrap();
        b.handle.join_room(room()).await.unwrap();
        a.wait_for_peers(1).await;
        b.wait_for_peers(1).await;

        a.handle.join_room(RoomKey::new("R2", "🙂")).await.unwrap();
        b.wait_for_peers(0).await;
        a.wait_for_peers(0).await;
        assert!(a.handle.peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requested_peering_hands_over_the_link() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Client::start(&broker, &connector, config("Alpha"));
        let mut b = Client::start(&broker, &connector, config("Bravo"));
        a.handle.join_room(room()).await.unwrap();
        b.handle.join_room(room()).await.unwrap();
        a.wait_for_peers(1).await;

        let a_link = a.handle.request_peer(b.handle.id().clone()).await.unwrap();
        let mut b_link = b
            .wait_for(|event| match event {
                SignalingEvent::IncomingPeering(link) => Some(link),
                _ => None,
            })
            .await;
        assert_eq!(a_link.role, Role::Initiator);
        assert_eq!(b_link.peer, *a.handle.id());

        a_link.control.send(ChannelMessage::Text("yo".into())).await.unwrap();
        loop {
            match b_link.control_events.recv().await.unwrap() {
                ChannelEvent::Message(message) => {
                    assert_eq!(message, ChannelMessage::Text("yo".into()));
                    break;
                }
                ChannelEvent::Open => {}
                other => panic!("unexpected {other:?}"),
            }
        }

        // Both sides release the relay after the handoff.
        a.wait_for(|e| matches!(e, SignalingEvent::Closed).then_some(())).await;
        b.wait_for(|e| matches!(e, SignalingEvent::Closed).then_some(())).await;
    }

    #[tokio::test]
    async fn identity_file_is_reused_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let persistent = || SignalingConfig {
            identity_file: Some(path.clone()),
            ..config("Alpha")
        };

        let first = Client::start(&broker, &connector, persistent());
        first.handle.shutdown().await;
        let second = Client::start(&broker, &connector, persistent());
        assert_eq!(second.handle.id(), first.handle.id());
        assert!(path.exists());

        let fresh = Client::start(&broker, &connector, config("Alpha"));
        assert_ne!(fresh.handle.id(), first.handle.id());
    }

    #[tokio::test]
    async fn requesting_outside_a_room_fails() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let a = Client::start(&broker, &connector, config("Alpha"));
        let err = a.handle.request_peer(Identity::generate()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AerodropError>(),
            Some(&AerodropError::Closed("signaling room"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_through_the_handle() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let a = Client::start(&broker, &connector, config("Alpha"));
        a.handle.join_room(room()).await.unwrap();

        let absent = Identity::generate();
        let err = a.handle.request_peer(absent.clone()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AerodropError>(),
            Some(&AerodropError::NegotiationTimeout { peer: absent })
        );
        // The client is still usable.
        assert!(a.handle.peers().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_client_releases_the_relay() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Client::start(
            &broker,
            &connector,
            SignalingConfig {
                idle_timeout: Some(Duration::from_secs(60)),
                ..config("Alpha")
            },
        );
        a.handle.join_room(room()).await.unwrap();

        let error = a
            .wait_for(|event| match event {
                SignalingEvent::Error(error) => Some(error),
                _ => None,
            })
            .await;
        assert_eq!(error, AerodropError::transport("disconnected due to inactivity"));
        a.wait_for(|e| matches!(e, SignalingEvent::Closed).then_some(())).await;
        assert!(a.handle.peers().await.is_err());
    }

    #[tokio::test]
    async fn refused_frames_are_survived_and_disconnect_is_terminal() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let relay = broker.connect();
        let (handle, mut events) =
            SignalingClient::spawn(relay.clone(), Arc::new(connector), config("Alpha")).unwrap();
        handle.join_room(room()).await.unwrap();

        relay.inject_error("topic too long");
        assert!(handle.peers().await.unwrap().is_empty());

        relay.close().await;
        let mut errors = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                SignalingEvent::Error(error) => errors.push(error),
                SignalingEvent::Closed => break,
                _ => continue,
            }
        }
        assert_eq!(errors, vec![AerodropError::transport("closed by client")]);
        assert!(handle.peers().await.is_err());
    }
}
