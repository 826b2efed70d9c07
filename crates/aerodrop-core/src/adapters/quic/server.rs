//! Quinn-based publish/subscribe broker.
//!
//! Every client opens one bidirectional stream and sends `Subscribe`,
//! `Unsubscribe` and `Publish` frames on it. A publish is delivered to every
//! subscriber of the topic, the publisher included. The broker never looks
//! inside payloads.
//!
//! Each client has its own bounded outbox drained by a writer task. A
//! subscriber whose outbox is full misses deliveries instead of stalling
//! the publisher.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use super::codec::{encode, read_frame, RelayFrame};

/// Topic names longer than this are refused.
const MAX_TOPIC_LEN: usize = 512;

/// Encoded frames queued per client before deliveries are dropped.
const OUTBOX_FRAMES: usize = 64;

// ---------------------------------------------------------------------------
// Per-client state
// ---------------------------------------------------------------------------

struct ClientConn {
    id: u64,
    outbox: mpsc::Sender<Bytes>,
}

impl ClientConn {
    /// Queue an encoded frame without waiting on the client.
    fn queue(&self, frame: Bytes) {
        match self.outbox.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client = self.id, "Outbox full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client = self.id, "Writer gone, dropping frame");
            }
        }
    }
}

async fn write_loop(id: u64, mut send: SendStream, mut outbox: mpsc::Receiver<Bytes>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = send.write_all(&frame).await {
            debug!(client = id, "Writer stopped: {e}");
            return;
        }
    }
    let _ = send.finish();
}

// ---------------------------------------------------------------------------
// QuicRelayBroker
// ---------------------------------------------------------------------------

pub struct QuicRelayBroker {
    endpoint: Endpoint,
    clients: RwLock<HashMap<u64, Arc<ClientConn>>>,
    topics: RwLock<HashMap<String, HashSet<u64>>>,
    next_client_id: AtomicU64,
}

impl QuicRelayBroker {
    /// Create and bind the broker.
    pub fn new(bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let server_config = Self::generate_self_signed_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)?;
        info!(addr = %endpoint.local_addr()?, "Relay broker listening");

        Ok(Self {
            endpoint,
            clients: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Run the accept loop until the endpoint is closed.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        while let Some(incoming) = self.endpoint.accept().await {
            let broker = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        if let Err(e) = broker.handle_connection(conn).await {
                            debug!("Connection handler ended: {e}");
                        }
                    }
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connection handling
    // -----------------------------------------------------------------------

    async fn handle_connection(self: &Arc<Self>, connection: Connection) -> anyhow::Result<()> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let remote = connection.remote_address();
        info!(client = id, %remote, "New relay client");

        let (send, mut recv) = connection.accept_bi().await?;
        let (outbox, queued) = mpsc::channel(OUTBOX_FRAMES);
        tokio::spawn(write_loop(id, send, queued));
        let client = Arc::new(ClientConn { id, outbox });
        self.clients.write().await.insert(id, Arc::clone(&client));

        let result = self.frame_loop(&client, &mut recv).await;
        self.remove_client(id).await;
        info!(client = id, "Relay client gone");
        result
    }

    async fn frame_loop(&self, client: &ClientConn, recv: &mut RecvStream) -> anyhow::Result<()> {
        while let Some(frame) = read_frame(recv).await? {
            match frame {
                RelayFrame::Subscribe { topic } | RelayFrame::Unsubscribe { topic }
                    if topic.len() > MAX_TOPIC_LEN =>
                {
                    self.refuse(client, "topic too long");
                }
                RelayFrame::Subscribe { topic } => {
                    trace!(client = client.id, %topic, "Subscribe");
                    self.topics
                        .write()
                        .await
                        .entry(topic)
                        .or_default()
                        .insert(client.id);
                }
                RelayFrame::Unsubscribe { topic } => {
                    trace!(client = client.id, %topic, "Unsubscribe");
                    let mut topics = self.topics.write().await;
                    if let Some(subscribers) = topics.get_mut(&topic) {
                        subscribers.remove(&client.id);
                        if subscribers.is_empty() {
                            topics.remove(&topic);
                        }
                    }
                }
                RelayFrame::Publish { topic, payload } => {
                    self.publish(client, topic, payload).await;
                }
                other => {
                    warn!(client = client.id, ?other, "Client sent a broker-only frame");
                    self.refuse(client, "unexpected frame");
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, publisher: &ClientConn, topic: String, payload: Vec<u8>) {
        let targets: Vec<Arc<ClientConn>> = {
            let topics = self.topics.read().await;
            let Some(subscribers) = topics.get(&topic) else {
                return;
            };
            let clients = self.clients.read().await;
            subscribers
                .iter()
                .filter_map(|id| clients.get(id).cloned())
                .collect()
        };
        trace!(%topic, subscribers = targets.len(), len = payload.len(), "Publish");

        let frame = match encode(&RelayFrame::Deliver { topic, payload }) {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                warn!(client = publisher.id, "Cannot deliver publish: {e}");
                self.refuse(publisher, "publish too large");
                return;
            }
        };
        for target in targets {
            target.queue(frame.clone());
        }
    }

    fn refuse(&self, client: &ClientConn, message: &str) {
        let frame = RelayFrame::Error {
            message: message.to_owned(),
        };
        match encode(&frame) {
            Ok(frame) => client.queue(Bytes::from(frame)),
            Err(e) => warn!(client = client.id, "Failed to encode error frame: {e}"),
        }
    }

    async fn remove_client(&self, id: u64) {
        self.clients.write().await.remove(&id);
        let mut topics = self.topics.write().await;
        for subscribers in topics.values_mut() {
            subscribers.remove(&id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
    }

    // -----------------------------------------------------------------------
    // Self-signed TLS config
    // -----------------------------------------------------------------------

    fn generate_self_signed_config() -> anyhow::Result<ServerConfig> {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])?;
        let cert_der = cert.cert.der().to_vec();
        let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![rustls::pki_types::CertificateDer::from(cert_der)],
                rustls::pki_types::PrivateKeyDer::Pkcs8(key_der),
            )?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_idle_timeout(Some(quinn::IdleTimeout::try_from(
            std::time::Duration::from_secs(60),
        )?));
        transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(15)));

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_config.transport_config(Arc::new(transport_config));
        Ok(server_config)
    }
}
