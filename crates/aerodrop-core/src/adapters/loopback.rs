//! In-process direct transport.
//!
//! Connections opened by the same [`LoopbackConnector`] find each other
//! through a token carried in their session descriptions. Two connections
//! link once each holds a local description, the other's remote description
//! and at least one remote candidate, mirroring when a real connection
//! becomes usable. Channels are always ordered and reliable.
//!
//! Every channel has an unbounded outbox drained by a pump task into the
//! remote side's bounded event queue, so `buffered_amount` grows when the
//! remote reader falls behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::application::ports::{
    ChannelEvent, ChannelMessage, ChannelOptions, ChannelState, ConnectionEvent, ConnectionState,
    DataChannel, PeerConnection, PeerConnector,
};
use crate::domain::signaling::{IceCandidate, SdpKind, SessionDescription};

const EVENT_BUFFER: usize = 64;
const TOKEN_ATTRIBUTE: &str = "a=loopback-token:";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Network {
    next_token: u64,
    endpoints: HashMap<u64, Weak<LoopbackConnection>>,
}

/// Shared in-process "network"; clone it to hand it to several clients.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    network: Arc<Mutex<Network>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) -> Arc<LoopbackConnection> {
        let mut network = lock(&self.network);
        network.next_token += 1;
        let token = network.next_token;
        let (tx, rx) = mpsc::unbounded_channel();

        let connection = Arc::new_cyclic(|me| LoopbackConnection {
            token,
            me: me.clone(),
            connector: self.clone(),
            endpoint: Mutex::new(Endpoint::default()),
            events: tx,
            events_rx: Mutex::new(Some(rx)),
        });
        network.endpoints.insert(token, Arc::downgrade(&connection));
        debug!(token, "Loopback connection opened");
        connection
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self) -> anyhow::Result<Arc<dyn PeerConnection>> {
        Ok(self.open())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Endpoint {
    state: ConnectionState,
    local: Option<SessionDescription>,
    remote_token: Option<u64>,
    remote_candidate: bool,
    peer: Weak<LoopbackConnection>,
    linked: bool,
    channels: Vec<Arc<LoopbackChannel>>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            state: ConnectionState::New,
            local: None,
            remote_token: None,
            remote_candidate: false,
            peer: Weak::new(),
            linked: false,
            channels: Vec::new(),
        }
    }
}

impl Endpoint {
    fn ready(&self) -> bool {
        !self.linked
            && self.state != ConnectionState::Closed
            && self.local.is_some()
            && self.remote_token.is_some()
            && self.remote_candidate
    }
}

pub struct LoopbackConnection {
    token: u64,
    me: Weak<LoopbackConnection>,
    connector: LoopbackConnector,
    endpoint: Mutex<Endpoint>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl LoopbackConnection {
    fn endpoint(&self) -> MutexGuard<'_, Endpoint> {
        lock(&self.endpoint)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.endpoint().state == ConnectionState::Closed {
            anyhow::bail!("connection closed");
        }
        Ok(())
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!(
                "v=0\r\no=- {token} 0 IN IP4 127.0.0.1\r\ns=-\r\n{TOKEN_ATTRIBUTE}{token}\r\n",
                token = self.token
            ),
        }
    }

    fn host_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.token,
                9000 + self.token % 1000
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// Link with the remote endpoint if both sides are ready.
    fn try_link(&self) {
        let network = lock(&self.connector.network);
        let Some(peer) = ({
            let endpoint = self.endpoint();
            if !endpoint.ready() {
                return;
            }
            endpoint
                .remote_token
                .and_then(|token| network.endpoints.get(&token))
                .and_then(Weak::upgrade)
        }) else {
            return;
        };

        let (mine, theirs) = {
            let mut local = self.endpoint();
            let mut remote = peer.endpoint();
            if !remote.ready() || remote.remote_token != Some(self.token) {
                return;
            }
            local.linked = true;
            remote.linked = true;
            local.peer = Arc::downgrade(&peer);
            remote.peer = self.me.clone();
            local.state = ConnectionState::Connected;
            remote.state = ConnectionState::Connected;
            (local.channels.clone(), remote.channels.clone())
        };
        drop(network);

        debug!(local = self.token, remote = peer.token, "Loopback connections linked");
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        peer.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
        for channel in mine {
            attach(&channel, &peer);
        }
        for channel in theirs {
            attach(&channel, self);
        }
    }

    fn closed_by_peer(&self) {
        {
            let mut endpoint = self.endpoint();
            if endpoint.state == ConnectionState::Closed {
                return;
            }
            endpoint.state = ConnectionState::Closed;
        }
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
    }
}

/// Announce `channel`'s counterpart on `remote` and open both.
fn attach(channel: &Arc<LoopbackChannel>, remote: &LoopbackConnection) {
    let counterpart = LoopbackChannel::new(&channel.label);
    remote.endpoint().channels.push(Arc::clone(&counterpart));
    LoopbackChannel::pair(channel, &counterpart);
    remote.emit(ConnectionEvent::DataChannel(counterpart));
}

fn parse_token(sdp: &str) -> Option<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(TOKEN_ATTRIBUTE))
        .and_then(|token| token.trim().parse().ok())
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.ensure_open()?;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.ensure_open()?;
        if self.endpoint().remote_token.is_none() {
            anyhow::bail!("cannot answer without a remote offer");
        }
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.endpoint().local = Some(desc);
        self.emit(ConnectionEvent::LocalCandidate(self.host_candidate()));
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.ensure_open()?;
        let token = parse_token(&desc.sdp)
            .ok_or_else(|| anyhow::anyhow!("session description has no loopback token"))?;
        let was_new = {
            let mut endpoint = self.endpoint();
            endpoint.remote_token = Some(token);
            let was_new = endpoint.state == ConnectionState::New;
            if was_new {
                endpoint.state = ConnectionState::Connecting;
            }
            was_new
        };
        if was_new {
            self.emit(ConnectionEvent::StateChanged(ConnectionState::Connecting));
        }
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.ensure_open()?;
        {
            let mut endpoint = self.endpoint();
            if endpoint.remote_token.is_none() {
                anyhow::bail!("remote description not set");
            }
            endpoint.remote_candidate = true;
        }
        trace!(token = self.token, candidate = %candidate.candidate, "Remote candidate added");
        self.try_link();
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        _options: ChannelOptions,
    ) -> anyhow::Result<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        let channel = LoopbackChannel::new(label);
        let peer = {
            let mut endpoint = self.endpoint();
            endpoint.channels.push(Arc::clone(&channel));
            endpoint.linked.then(|| endpoint.peer.upgrade()).flatten()
        };
        if let Some(peer) = peer {
            attach(&channel, &peer);
        }
        Ok(channel)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        lock(&self.events_rx).take()
    }

    async fn close(&self) {
        let (channels, peer) = {
            let mut endpoint = self.endpoint();
            if endpoint.state == ConnectionState::Closed {
                return;
            }
            endpoint.state = ConnectionState::Closed;
            (std::mem::take(&mut endpoint.channels), endpoint.peer.clone())
        };
        lock(&self.connector.network).endpoints.remove(&self.token);
        for channel in channels {
            channel.close().await;
        }
        self.emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
        if let Some(peer) = peer.upgrade() {
            peer.closed_by_peer();
        }
        debug!(token = self.token, "Loopback connection closed");
    }
}

// ---------------------------------------------------------------------------
// Data channel
// ---------------------------------------------------------------------------

enum Outgoing {
    Message(ChannelMessage),
    Close,
}

#[derive(Default)]
struct Buffered {
    amount: AtomicUsize,
    drained: Notify,
}

impl Buffered {
    fn release(&self, len: usize) {
        self.amount.fetch_sub(len, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    fn clear(&self) {
        self.amount.store(0, Ordering::Release);
        self.drained.notify_waiters();
    }
}

pub struct LoopbackChannel {
    label: String,
    state: Mutex<ChannelState>,
    events: mpsc::Sender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    outbox: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    buffered: Arc<Buffered>,
}

impl LoopbackChannel {
    fn new(label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Arc::new(Self {
            label: label.to_owned(),
            state: Mutex::new(ChannelState::Connecting),
            events: tx,
            events_rx: Mutex::new(Some(rx)),
            outbox: Mutex::new(None),
            buffered: Arc::default(),
        })
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        a.connect_to(b);
        b.connect_to(a);
        a.open();
        b.open();
    }

    fn connect_to(&self, remote: &Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.outbox) = Some(tx);
        tokio::spawn(pump(rx, Arc::clone(&self.buffered), Arc::downgrade(remote)));
    }

    fn open(&self) {
        *lock(&self.state) = ChannelState::Open;
        let _ = self.events.try_send(ChannelEvent::Open);
    }

    /// Returns whether this call moved the channel to `Closed`.
    fn mark_closed(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == ChannelState::Closed {
            return false;
        }
        *state = ChannelState::Closed;
        true
    }

    async fn deliver(&self, message: ChannelMessage) -> bool {
        self.events.send(ChannelEvent::Message(message)).await.is_ok()
    }

    async fn closed_by_peer(&self) {
        lock(&self.outbox).take();
        self.buffered.clear();
        if self.mark_closed() {
            trace!(label = %self.label, "Channel closed by peer");
            let _ = self.events.send(ChannelEvent::Closed).await;
        }
    }
}

async fn pump(
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
    buffered: Arc<Buffered>,
    remote: Weak<LoopbackChannel>,
) {
    while let Some(Outgoing::Message(message)) = outbox.recv().await {
        let len = message.len();
        let delivered = match remote.upgrade() {
            Some(remote) => remote.deliver(message).await,
            None => false,
        };
        buffered.release(len);
        if !delivered {
            break;
        }
    }
    buffered.clear();
    if let Some(remote) = remote.upgrade() {
        remote.closed_by_peer().await;
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    async fn send(&self, message: ChannelMessage) -> anyhow::Result<()> {
        if self.state() != ChannelState::Open {
            anyhow::bail!("data channel {:?} is not open", self.label);
        }
        let Some(outbox) = lock(&self.outbox).clone() else {
            anyhow::bail!("data channel {:?} is closed", self.label);
        };
        let len = message.len();
        self.buffered.amount.fetch_add(len, Ordering::AcqRel);
        if outbox.send(Outgoing::Message(message)).is_err() {
            self.buffered.release(len);
            anyhow::bail!("data channel {:?} is closed", self.label);
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.amount.load(Ordering::Acquire)
    }

    async fn wait_buffered_below(&self, threshold: usize) {
        loop {
            let drained = self.buffered.drained.notified();
            if self.buffered_amount() <= threshold || self.state() != ChannelState::Open {
                return;
            }
            drained.await;
        }
    }

    fn take_events(&self) -> Option<mpsc::Receiver<ChannelEvent>> {
        lock(&self.events_rx).take()
    }

    async fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        if let Some(outbox) = lock(&self.outbox).take() {
            let _ = outbox.send(Outgoing::Close);
        }
        self.buffered.drained.notify_waiters();
        let _ = self.events.try_send(ChannelEvent::Closed);
    }
}
