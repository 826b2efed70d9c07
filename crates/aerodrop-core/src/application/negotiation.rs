//! Negotiation state machine.
//!
//! Turns "I want to peer with X" into an open control channel on a direct
//! connection, using the [`SignalingChannel`] as an encrypted mailbox while
//! the connection is assembled:
//!
//! ```text
//! Idle --request_peer--> AwaitingResponse --Response--> Negotiating(initiator)
//! Idle --Request-------> Negotiating(responder)
//! Negotiating --control channel open--> Idle (DirectLink handed off)
//! any --timeout / Busy / connection failure--> Idle (Failed)
//! ```
//!
//! One negotiation at a time. A `Request` from anyone else while busy is
//! answered with `Busy`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::domain::error::AerodropError;
use crate::domain::identity::Identity;
use crate::domain::peering::CONTROL_CHANNEL_LABEL;
use crate::domain::signaling::{IceCandidate, SessionDescription, SignalingPacket};

use super::ports::{
    ChannelEvent, ChannelOptions, ChannelState, ConnectionEvent, DataChannel, PeerConnection,
    PeerConnector,
};
use super::signaling_channel::SignalingChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// An established direct connection with its open control channel.
pub struct DirectLink {
    pub peer: Identity,
    pub role: Role,
    pub connection: Arc<dyn PeerConnection>,
    pub connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub control: Arc<dyn DataChannel>,
    pub control_events: mpsc::Receiver<ChannelEvent>,
}

impl std::fmt::Debug for DirectLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectLink")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("control", &self.control.label())
            .finish_non_exhaustive()
    }
}

/// Something the negotiator is waiting on happened.
#[derive(Debug)]
pub enum NegotiationInput {
    Deadline,
    Connection(Option<ConnectionEvent>),
    Control(Option<ChannelEvent>),
}

#[derive(Debug)]
pub enum Outcome {
    Pending,
    Started { peer: Identity, role: Role },
    Established(DirectLink),
    Failed { peer: Identity, error: AerodropError },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Session {
    peer: Identity,
    role: Role,
    connection: Arc<dyn PeerConnection>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    control: Option<(Arc<dyn DataChannel>, mpsc::Receiver<ChannelEvent>)>,
    remote_applied: bool,
    /// Candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    deadline: Instant,
}

enum State {
    Idle,
    AwaitingResponse { target: Identity, deadline: Instant },
    Negotiating(Box<Session>),
}

pub struct Negotiator {
    identity: Identity,
    connector: Arc<dyn PeerConnector>,
    timeout: Duration,
    state: State,
}

impl Negotiator {
    pub fn new(identity: Identity, connector: Arc<dyn PeerConnector>, timeout: Duration) -> Self {
        Self {
            identity,
            connector,
            timeout,
            state: State::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// The peer of the negotiation in flight, if any.
    pub fn peer(&self) -> Option<&Identity> {
        match &self.state {
            State::Idle => None,
            State::AwaitingResponse { target, .. } => Some(target),
            State::Negotiating(session) => Some(&session.peer),
        }
    }

    // -----------------------------------------------------------------------
    // Local requests
    // -----------------------------------------------------------------------

    pub async fn request_peer(
        &mut self,
        channel: &mut SignalingChannel,
        target: Identity,
    ) -> Result<(), AerodropError> {
        if let Some(peer) = self.peer() {
            return Err(AerodropError::NegotiationBusy { peer: peer.clone() });
        }
        if target == self.identity {
            return Err(AerodropError::violation("cannot negotiate with ourselves"));
        }

        send(channel, &target, SignalingPacket::Request(self.identity.clone()))
            .await
            .map_err(AerodropError::transport)?;
        info!(peer = %target, "Requested peering");
        self.state = State::AwaitingResponse {
            target,
            deadline: Instant::now() + self.timeout,
        };
        Ok(())
    }

    /// Give up on the negotiation in flight, closing its connection.
    pub async fn abort(&mut self, error: AerodropError) -> Outcome {
        self.fail(error).await
    }

    // -----------------------------------------------------------------------
    // Signaling packets
    // -----------------------------------------------------------------------

    pub async fn handle_packet(
        &mut self,
        channel: &mut SignalingChannel,
        from: &Identity,
        packet: SignalingPacket,
    ) -> Outcome {
        match packet {
            SignalingPacket::Request(id) if id == *from => self.on_request(channel, from).await,
            SignalingPacket::Response(id) if id == *from => self.on_response(channel, from).await,
            SignalingPacket::Busy(id) if id == *from => self.on_busy(from),
            SignalingPacket::Request(_) | SignalingPacket::Response(_) | SignalingPacket::Busy(_) => {
                warn!(peer = %from, "Dropping packet with a spoofed sender id");
                Outcome::Pending
            }
            SignalingPacket::Offer(offer) => self.on_offer(channel, from, offer).await,
            SignalingPacket::Answer(answer) => self.on_answer(from, answer).await,
            SignalingPacket::Candidate(candidate) => self.on_candidate(from, candidate).await,
            SignalingPacket::Resalt { .. } => Outcome::Pending,
        }
    }

    async fn on_request(&mut self, channel: &mut SignalingChannel, from: &Identity) -> Outcome {
        match &self.state {
            State::Idle => self.respond(channel, from).await,
            State::AwaitingResponse { target, .. } if target == from => {
                // Mutual request: the smaller identity stays initiator.
                if self.identity < *from {
                    debug!(peer = %from, "Mutual request, staying initiator");
                    Outcome::Pending
                } else {
                    debug!(peer = %from, "Mutual request, yielding to peer");
                    self.respond(channel, from).await
                }
            }
            State::Negotiating(session) if session.peer == *from => {
                debug!(peer = %from, "Duplicate request ignored");
                Outcome::Pending
            }
            _ => {
                warn!(peer = %from, busy_with = ?self.peer(), "Rejecting request while busy");
                if let Err(e) = send(channel, from, SignalingPacket::Busy(self.identity.clone())).await {
                    warn!(peer = %from, "Failed to send Busy: {e}");
                }
                Outcome::Pending
            }
        }
    }

    async fn respond(&mut self, channel: &mut SignalingChannel, from: &Identity) -> Outcome {
        if let Err(e) = send(channel, from, SignalingPacket::Response(self.identity.clone())).await {
            self.state = State::Idle;
            return Outcome::Failed {
                peer: from.clone(),
                error: AerodropError::transport(e),
            };
        }
        info!(peer = %from, "Accepted peering request");
        self.start_session(channel, from.clone(), Role::Responder).await
    }

    async fn on_response(&mut self, channel: &mut SignalingChannel, from: &Identity) -> Outcome {
        match &self.state {
            State::AwaitingResponse { target, .. } if target == from => {
                info!(peer = %from, "Peer accepted our request");
                self.start_session(channel, from.clone(), Role::Initiator).await
            }
            _ => {
                warn!(peer = %from, "Ignoring unexpected Response");
                Outcome::Pending
            }
        }
    }

    fn on_busy(&mut self, from: &Identity) -> Outcome {
        match &self.state {
            State::AwaitingResponse { target, .. } if target == from => {
                warn!(peer = %from, "Peer is busy");
                self.state = State::Idle;
                Outcome::Failed {
                    peer: from.clone(),
                    error: AerodropError::NegotiationRejected { peer: from.clone() },
                }
            }
            _ => {
                debug!(peer = %from, "Ignoring stray Busy");
                Outcome::Pending
            }
        }
    }

    async fn on_offer(
        &mut self,
        channel: &mut SignalingChannel,
        from: &Identity,
        offer: SessionDescription,
    ) -> Outcome {
        let timeout = self.timeout;
        let Some(session) = self.session_with(from) else {
            warn!(peer = %from, "Ignoring Offer outside a negotiation");
            return Outcome::Pending;
        };
        if session.role != Role::Responder {
            warn!(peer = %from, "Ignoring Offer while initiating");
            return Outcome::Pending;
        }

        let result: anyhow::Result<()> = async {
            session.connection.set_remote_description(offer).await?;
            session.remote_applied = true;
            flush_candidates(session).await;
            let answer = session.connection.create_answer().await?;
            session.connection.set_local_description(answer.clone()).await?;
            send(channel, from, SignalingPacket::Answer(answer)).await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(peer = %from, "Offer applied, Answer sent");
                session.deadline = Instant::now() + timeout;
                Outcome::Pending
            }
            Err(e) => self.fail(AerodropError::transport(e)).await,
        }
    }

    async fn on_answer(&mut self, from: &Identity, answer: SessionDescription) -> Outcome {
        let timeout = self.timeout;
        let Some(session) = self.session_with(from) else {
            warn!(peer = %from, "Ignoring Answer outside a negotiation");
            return Outcome::Pending;
        };
        if session.role != Role::Initiator || session.remote_applied {
            warn!(peer = %from, "Ignoring unexpected Answer");
            return Outcome::Pending;
        }

        match session.connection.set_remote_description(answer).await {
            Ok(()) => {
                debug!(peer = %from, "Answer applied");
                session.remote_applied = true;
                session.deadline = Instant::now() + timeout;
                flush_candidates(session).await;
                Outcome::Pending
            }
            Err(e) => self.fail(AerodropError::transport(e)).await,
        }
    }

    async fn on_candidate(&mut self, from: &Identity, candidate: IceCandidate) -> Outcome {
        let Some(session) = self.session_with(from) else {
            debug!(peer = %from, "Ignoring Candidate outside a negotiation");
            return Outcome::Pending;
        };
        if !session.remote_applied {
            trace!(peer = %from, "Buffering early candidate");
            session.pending_candidates.push(candidate);
        } else if let Err(e) = session.connection.add_ice_candidate(candidate).await {
            warn!(peer = %from, "Rejected remote candidate: {e}");
        }
        Outcome::Pending
    }

    // -----------------------------------------------------------------------
    // Connection progress
    // -----------------------------------------------------------------------

    /// Wait for the next deadline or connection event. Pends forever while
    /// idle; safe to cancel.
    pub async fn next_input(&mut self) -> NegotiationInput {
        match &mut self.state {
            State::Idle => std::future::pending().await,
            State::AwaitingResponse { deadline, .. } => {
                sleep_until(*deadline).await;
                NegotiationInput::Deadline
            }
            State::Negotiating(session) => {
                let Session {
                    events,
                    control,
                    deadline,
                    ..
                } = &mut **session;
                let control = async {
                    match control.as_mut() {
                        Some((_, events)) => events.recv().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = sleep_until(*deadline) => NegotiationInput::Deadline,
                    event = events.recv() => NegotiationInput::Connection(event),
                    event = control => NegotiationInput::Control(event),
                }
            }
        }
    }

    pub async fn handle_input(
        &mut self,
        channel: &mut SignalingChannel,
        input: NegotiationInput,
    ) -> Outcome {
        let Some(peer) = self.peer().cloned() else {
            return Outcome::Pending;
        };
        match input {
            NegotiationInput::Deadline => {
                warn!(%peer, "Negotiation timed out");
                self.fail(AerodropError::NegotiationTimeout { peer }).await
            }
            NegotiationInput::Connection(None) => {
                self.fail(AerodropError::transport("connection event stream ended")).await
            }
            NegotiationInput::Connection(Some(event)) => {
                self.on_connection_event(channel, &peer, event).await
            }
            NegotiationInput::Control(Some(ChannelEvent::Open)) => self.finish(),
            NegotiationInput::Control(Some(ChannelEvent::Message(_))) => {
                debug!(%peer, "Control message before open ignored");
                Outcome::Pending
            }
            NegotiationInput::Control(Some(ChannelEvent::Error(e))) => {
                self.fail(AerodropError::Transport(e)).await
            }
            NegotiationInput::Control(Some(ChannelEvent::Closed) | None) => {
                self.fail(AerodropError::transport("control channel closed during negotiation"))
                    .await
            }
        }
    }

    async fn on_connection_event(
        &mut self,
        channel: &mut SignalingChannel,
        peer: &Identity,
        event: ConnectionEvent,
    ) -> Outcome {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                trace!(%peer, "Forwarding local candidate");
                match send(channel, peer, SignalingPacket::Candidate(candidate)).await {
                    Ok(()) => Outcome::Pending,
                    Err(e) => self.fail(AerodropError::transport(e)).await,
                }
            }
            ConnectionEvent::DataChannel(data_channel) => {
                let Some(session) = self.session_with(peer) else {
                    return Outcome::Pending;
                };
                if session.control.is_some() || data_channel.label() != CONTROL_CHANNEL_LABEL {
                    warn!(%peer, label = data_channel.label(), "Closing unexpected channel");
                    data_channel.close().await;
                    return Outcome::Pending;
                }
                let Some(events) = data_channel.take_events() else {
                    return self
                        .fail(AerodropError::transport("control channel events already taken"))
                        .await;
                };
                let open = data_channel.state() == ChannelState::Open;
                session.control = Some((data_channel, events));
                if open {
                    self.finish()
                } else {
                    Outcome::Pending
                }
            }
            ConnectionEvent::StateChanged(state) if state.is_terminal() => {
                self.fail(AerodropError::Transport(format!("connection {state:?}")))
                    .await
            }
            ConnectionEvent::StateChanged(state) => {
                debug!(%peer, ?state, "Connection state");
                Outcome::Pending
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn start_session(
        &mut self,
        channel: &mut SignalingChannel,
        peer: Identity,
        role: Role,
    ) -> Outcome {
        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                error!(%peer, "Failed to create connection: {e}");
                self.state = State::Idle;
                return Outcome::Failed {
                    peer,
                    error: AerodropError::transport(e),
                };
            }
        };

        match self.prepare(channel, &peer, role, &connection).await {
            Ok(session) => {
                debug!(%peer, ?role, "Negotiating");
                self.state = State::Negotiating(Box::new(session));
                Outcome::Started { peer, role }
            }
            Err(e) => {
                error!(%peer, "Failed to start negotiation: {e}");
                connection.close().await;
                self.state = State::Idle;
                Outcome::Failed {
                    peer,
                    error: AerodropError::transport(e),
                }
            }
        }
    }

    async fn prepare(
        &self,
        channel: &mut SignalingChannel,
        peer: &Identity,
        role: Role,
        connection: &Arc<dyn PeerConnection>,
    ) -> anyhow::Result<Session> {
        let events = connection
            .take_events()
            .ok_or_else(|| anyhow::anyhow!("connection events already taken"))?;

        let mut control = None;
        if role == Role::Initiator {
            let data_channel = connection
                .create_data_channel(CONTROL_CHANNEL_LABEL, ChannelOptions::default())
                .await?;
            let control_events = data_channel
                .take_events()
                .ok_or_else(|| anyhow::anyhow!("control channel events already taken"))?;
            control = Some((data_channel, control_events));

            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            send(channel, peer, SignalingPacket::Offer(offer)).await?;
        }

        Ok(Session {
            peer: peer.clone(),
            role,
            connection: Arc::clone(connection),
            events,
            control,
            remote_applied: false,
            pending_candidates: Vec::new(),
            deadline: Instant::now() + self.timeout,
        })
    }

    fn finish(&mut self) -> Outcome {
        let State::Negotiating(session) = std::mem::replace(&mut self.state, State::Idle) else {
            return Outcome::Pending;
        };
        let Session {
            peer,
            role,
            connection,
            events,
            control,
            ..
        } = *session;
        let Some((control, control_events)) = control else {
            // Open without a control channel cannot happen; put it back.
            self.state = State::Negotiating(Box::new(Session {
                peer,
                role,
                connection,
                events,
                control: None,
                remote_applied: true,
                pending_candidates: Vec::new(),
                deadline: Instant::now() + self.timeout,
            }));
            return Outcome::Pending;
        };

        info!(%peer, ?role, "Direct connection established");
        Outcome::Established(DirectLink {
            peer,
            role,
            connection,
            connection_events: events,
            control,
            control_events,
        })
    }

    async fn fail(&mut self, error: AerodropError) -> Outcome {
        let peer = match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => return Outcome::Pending,
            State::AwaitingResponse { target, .. } => target,
            State::Negotiating(session) => {
                if let Some((control, _)) = &session.control {
                    control.close().await;
                }
                session.connection.close().await;
                session.peer
            }
        };
        warn!(%peer, "Negotiation failed: {error}");
        Outcome::Failed { peer, error }
    }

    fn session_with(&mut self, peer: &Identity) -> Option<&mut Session> {
        match &mut self.state {
            State::Negotiating(session) if session.peer == *peer => Some(session),
            _ => None,
        }
    }
}

async fn send(
    channel: &mut SignalingChannel,
    to: &Identity,
    packet: SignalingPacket,
) -> anyhow::Result<()> {
    channel.send(&packet.encode(), Some(to)).await
}

async fn flush_candidates(session: &mut Session) {
    for candidate in std::mem::take(&mut session.pending_candidates) {
        if let Err(e) = session.connection.add_ice_candidate(candidate).await {
            warn!(peer = %session.peer, "Rejected buffered candidate: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::loopback::LoopbackConnector;
    use crate::adapters::memory_relay::MemoryBroker;
    use crate::application::ports::{ChannelMessage, RelayEvent, RelayTransport};
    use crate::application::signaling_channel::Inbound;
    use crate::config::CipherConfig;
    use crate::domain::identity::RoomKey;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Node {
        channel: SignalingChannel,
        events: mpsc::UnboundedReceiver<RelayEvent>,
        negotiator: Negotiator,
    }

    enum Step {
        Relay(RelayEvent),
        Negotiation(NegotiationInput),
    }

    impl Node {
        async fn join(broker: &MemoryBroker, connector: &LoopbackConnector) -> Self {
            let relay = broker.connect();
            let events = relay.take_events().unwrap();
            let id = Identity::generate();
            let mut channel = SignalingChannel::new(
                relay,
                id.clone(),
                "TEST",
                CipherConfig { kdf_iterations: 1_000 },
            );
            channel.subscribe_room(&RoomKey::new("R1", "😀")).await.unwrap();
            // Announce our salt so the first direct message can be read.
            channel.broadcast("[]").await.unwrap();
            let negotiator = Negotiator::new(id, Arc::new(connector.clone()), TIMEOUT);
            Self { channel, events, negotiator }
        }

        fn id(&self) -> Identity {
            self.channel.identity().clone()
        }

        async fn step(&mut self) -> Outcome {
            let step = tokio::select! {
                Some(event) = self.events.recv() => Step::Relay(event),
                input = self.negotiator.next_input() => Step::Negotiation(input),
            };
            match step {
                Step::Relay(event) => match self.channel.handle_relay_event(event).await {
                    Some(Inbound::Direct { from, data }) => {
                        let packet = SignalingPacket::decode(&data).unwrap();
                        self.negotiator.handle_packet(&mut self.channel, &from, packet).await
                    }
                    _ => Outcome::Pending,
                },
                Step::Negotiation(input) => {
                    self.negotiator.handle_input(&mut self.channel, input).await
                }
            }
        }

        /// Process whatever the relay already delivered, learning salts.
        async fn settle(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.channel.handle_relay_event(event).await;
            }
        }

        /// Run until the negotiation resolves one way or the other.
        async fn drive(mut self) -> (Self, Outcome) {
            loop {
                match self.step().await {
                    outcome @ (Outcome::Established(_) | Outcome::Failed { .. }) => {
                        return (self, outcome)
                    }
                    _ => {}
                }
            }
        }
    }

    async fn pair() -> (Node, Node) {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Node::join(&broker, &connector).await;
        let mut b = Node::join(&broker, &connector).await;
        a.settle().await;
        b.settle().await;
        (a, b)
    }

    fn established(outcome: Outcome) -> DirectLink {
        match outcome {
            Outcome::Established(link) => link,
            other => panic!("expected an established link, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_and_response_open_the_control_channel() {
        let (mut a, b) = pair().await;
        let (a_id, b_id) = (a.id(), b.id());
        a.negotiator.request_peer(&mut a.channel, b_id.clone()).await.unwrap();

        let (a_out, b_out) = tokio::join!(a.drive(), b.drive());
        let a_link = established(a_out.1);
        let mut b_link = established(b_out.1);
        assert!(a_out.0.negotiator.is_idle());
        assert!(b_out.0.negotiator.is_idle());

        assert_eq!((a_link.peer.clone(), a_link.role), (b_id, Role::Initiator));
        assert_eq!((b_link.peer.clone(), b_link.role), (a_id, Role::Responder));
        assert_eq!(b_link.control.label(), CONTROL_CHANNEL_LABEL);

        a_link
            .control
            .send(ChannelMessage::Text("ping".into()))
            .await
            .unwrap();
        loop {
            match b_link.control_events.recv().await.unwrap() {
                ChannelEvent::Open => continue,
                event => {
                    assert_eq!(event, ChannelEvent::Message(ChannelMessage::Text("ping".into())));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn busy_peer_answers_busy_instead_of_response() {
        let (mut a, mut b) = pair().await;
        let (b_id, absent) = (b.id(), Identity::generate());

        b.negotiator.request_peer(&mut b.channel, absent.clone()).await.unwrap();
        a.negotiator.request_peer(&mut a.channel, b_id.clone()).await.unwrap();

        let outcome = tokio::select! {
            (_, outcome) = a.drive() => outcome,
            _ = async {
                loop {
                    assert!(matches!(b.step().await, Outcome::Pending));
                }
            } => unreachable!(),
        };
        match outcome {
            Outcome::Failed { peer, error } => {
                assert_eq!(peer, b_id.clone());
                assert_eq!(error, AerodropError::NegotiationRejected { peer: b_id });
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(b.negotiator.peer(), Some(&absent));
    }

    #[tokio::test]
    async fn busy_peer_keeps_its_own_negotiation() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut b = Node::join(&broker, &connector).await;
        let absent = Identity::generate();
        let intruder = Identity::generate();

        b.negotiator.request_peer(&mut b.channel, absent.clone()).await.unwrap();
        let outcome = b
            .negotiator
            .handle_packet(&mut b.channel, &intruder, SignalingPacket::Request(intruder.clone()))
            .await;
        assert!(matches!(outcome, Outcome::Pending));
        assert_eq!(b.negotiator.peer(), Some(&absent));

        let err = b.negotiator.request_peer(&mut b.channel, intruder).await.unwrap_err();
        assert_eq!(err, AerodropError::NegotiationBusy { peer: absent });
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let broker = MemoryBroker::new();
        let connector = LoopbackConnector::new();
        let mut a = Node::join(&broker, &connector).await;
        let absent = Identity::generate();

        let started = Instant::now();
        a.negotiator.request_peer(&mut a.channel, absent.clone()).await.unwrap();
        let (a, outcome) = a.drive().await;

        assert!(started.elapsed() >= TIMEOUT);
        match outcome {
            Outcome::Failed { peer, error } => {
                assert_eq!(peer, absent.clone());
                assert_eq!(error, AerodropError::NegotiationTimeout { peer: absent });
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(a.negotiator.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn responder_gives_up_when_no_offer_follows() {
        let (mut a, mut b) = pair().await;
        let (a_id, b_id) = (a.id(), b.id());

        let outcome = b
            .negotiator
            .handle_packet(&mut b.channel, &a_id, SignalingPacket::Request(a_id.clone()))
            .await;
        assert!(matches!(outcome, Outcome::Started { role: Role::Responder, .. }));

        // a hears the Response but never sends its Offer.
        let (from, data) = loop {
            let event = a.events.recv().await.unwrap();
            if let Some(Inbound::Direct { from, data }) = a.channel.handle_relay_event(event).await {
                break (from, data);
            }
        };
        assert_eq!(from, b_id.clone());
        assert_eq!(SignalingPacket::decode(&data).unwrap(), SignalingPacket::Response(b_id));

        let started = Instant::now();
        let (b, outcome) = b.drive().await;
        assert!(started.elapsed() >= TIMEOUT);
        match outcome {
            Outcome::Failed { peer, error } => {
                assert_eq!(peer, a_id.clone());
                assert_eq!(error, AerodropError::NegotiationTimeout { peer: a_id });
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(b.negotiator.is_idle());
        assert!(b.negotiator.peer().is_none());
    }

    #[tokio::test]
    async fn mutual_requests_pick_the_smaller_identity_as_initiator() {
        let (mut a, mut b) = pair().await;
        let (a_id, b_id) = (a.id(), b.id());
        a.negotiator.request_peer(&mut a.channel, b_id.clone()).await.unwrap();
        b.negotiator.request_peer(&mut b.channel, a_id.clone()).await.unwrap();

        let ((_, a_out), (_, b_out)) = tokio::join!(a.drive(), b.drive());
        let a_link = established(a_out);
        let b_link = established(b_out);

        let expected_a = if a_id < b_id { Role::Initiator } else { Role::Responder };
        assert_eq!(a_link.role, expected_a);
        assert_ne!(a_link.role, b_link.role);
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_until_the_offer() {
        let (mut a, mut b) = pair().await;
        let a_id = a.id();
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };

        b.negotiator
            .handle_packet(&mut b.channel, &a_id, SignalingPacket::Request(a_id.clone()))
            .await;
        b.negotiator
            .handle_packet(&mut b.channel, &a_id, SignalingPacket::Candidate(candidate))
            .await;
        let session = b.negotiator.session_with(&a_id).unwrap();
        assert_eq!(session.pending_candidates.len(), 1);
        assert!(!session.remote_applied);

        // A real offer from a flushes the queue.
        a.negotiator.request_peer(&mut a.channel, b.id()).await.unwrap();
        let (_, a_out) = a.drive_with(b).await;
        established(a_out);
    }

    impl Node {
        /// Drive `self` while `other` runs alongside until both resolve.
        async fn drive_with(self, other: Node) -> (Self, Outcome) {
            let (mine, theirs) = tokio::join!(self.drive(), other.drive());
            established(theirs.1);
            mine
        }
    }
}
