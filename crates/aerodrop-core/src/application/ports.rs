//! Port traits (interfaces) that use cases depend on.
//!
//! Adapters implement these traits; use cases never reference Quinn, the
//! in-memory broker or a concrete peer-connection stack.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::peering::FileMetadata;
use crate::domain::signaling::{IceCandidate, SessionDescription};

// ---------------------------------------------------------------------------
// Relay transport (publish/subscribe)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    Message { topic: String, payload: Bytes },
    /// The relay reported an error; treated as terminal by the client.
    Error(String),
    Disconnected(String),
}

/// Abstract publish/subscribe connection to a message relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Lifecycle and delivery events. Yields the receiver once; later calls
    /// return `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>>;

    /// Disconnect. Pending subscriptions are dropped.
    async fn close(&self);
}

// ---------------------------------------------------------------------------
// Direct transport (peer connection + data channels)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

pub enum ConnectionEvent {
    /// A locally gathered candidate to forward to the remote side.
    LocalCandidate(IceCandidate),
    /// The remote side opened a data channel.
    DataChannel(Arc<dyn DataChannel>),
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::DataChannel(ch) => f.debug_tuple("DataChannel").field(&ch.label()).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Creates fresh direct connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

/// One negotiated point-to-point connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;

    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;

    /// Fails if no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> anyhow::Result<Arc<dyn DataChannel>>;

    /// Yields the event receiver once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Closed,
    Error(String),
}

/// Named, bidirectional message channel on a [`PeerConnection`].
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn state(&self) -> ChannelState;

    async fn send(&self, message: ChannelMessage) -> anyhow::Result<()>;

    /// Bytes accepted by `send` but not yet handed to the remote side.
    fn buffered_amount(&self) -> usize;

    /// Resolves once `buffered_amount() <= threshold` or the channel closes.
    async fn wait_buffered_below(&self, threshold: usize);

    /// Yields the event receiver once.
    fn take_events(&self) -> Option<mpsc::Receiver<ChannelEvent>>;

    async fn close(&self);
}

// ---------------------------------------------------------------------------
// File source
// ---------------------------------------------------------------------------

/// Random-access readable file offered to a peer.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn metadata(&self) -> FileMetadata;

    /// Read up to `len` bytes at `offset`. Returns fewer bytes only at EOF.
    async fn read_chunk(&self, offset: u64, len: usize) -> anyhow::Result<Bytes>;
}
