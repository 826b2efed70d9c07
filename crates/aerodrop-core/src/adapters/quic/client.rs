//! Quinn-based relay client.
//!
//! One QUIC connection with a single bidirectional stream. Outgoing frames
//! are written under a lock; a reader task turns `Deliver` frames into
//! [`RelayEvent`]s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::application::ports::{RelayEvent, RelayTransport};

use super::codec::{read_frame, write_frame, RelayFrame};

// ---------------------------------------------------------------------------
// QuicRelayTransport
// ---------------------------------------------------------------------------

/// [`RelayTransport`] talking to a [`QuicRelayBroker`](super::server::QuicRelayBroker).
pub struct QuicRelayTransport {
    _endpoint: Endpoint,
    connection: Connection,
    send: Mutex<SendStream>,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    closed: Arc<AtomicBool>,
}

impl QuicRelayTransport {
    /// Connect to a broker and open the frame stream.
    pub async fn connect(server_addr: SocketAddr, server_name: &str) -> anyhow::Result<Arc<Self>> {
        let endpoint = client_endpoint(server_addr)?;
        info!(%server_addr, "Connecting to relay");
        let connection = endpoint.connect(server_addr, server_name)?.await?;
        let (send, recv) = connection.open_bi().await?;
        info!(%server_addr, "Relay connection established");

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RelayEvent::Connected);
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(read_loop(recv, tx, Arc::clone(&closed)));

        Ok(Arc::new(Self {
            _endpoint: endpoint,
            connection,
            send: Mutex::new(send),
            events: std::sync::Mutex::new(Some(rx)),
            closed,
        }))
    }

    async fn send_frame(&self, frame: RelayFrame) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("relay connection closed");
        }
        let mut send = self.send.lock().await;
        write_frame(&mut *send, &frame).await
    }
}

/// Client endpoint able to reach `server_addr`'s address family.
pub(super) fn client_endpoint(server_addr: SocketAddr) -> anyhow::Result<Endpoint> {
    let bind: SocketAddr = if server_addr.is_ipv6() {
        "[::]:0".parse()?
    } else {
        "0.0.0.0:0".parse()?
    };
    let mut endpoint = Endpoint::client(bind)?;

    // The broker presents a throwaway self-signed certificate; payloads
    // are end-to-end encrypted above this layer.
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    endpoint.set_default_client_config(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    )));
    Ok(endpoint)
}

async fn read_loop(
    mut recv: RecvStream,
    events: mpsc::UnboundedSender<RelayEvent>,
    closed: Arc<AtomicBool>,
) {
    let reason = loop {
        match read_frame(&mut recv).await {
            Ok(Some(RelayFrame::Deliver { topic, payload })) => {
                let _ = events.send(RelayEvent::Message {
                    topic,
                    payload: Bytes::from(payload),
                });
            }
            Ok(Some(RelayFrame::Error { message })) => {
                let _ = events.send(RelayEvent::Error(message));
            }
            Ok(Some(other)) => warn!(?other, "Unexpected frame from relay"),
            Ok(None) => break "relay finished the stream".to_owned(),
            Err(e) => break e.to_string(),
        }
    };
    if !closed.swap(true, Ordering::AcqRel) {
        debug!(%reason, "Relay connection lost");
        let _ = events.send(RelayEvent::Disconnected(reason));
    }
}

#[async_trait]
impl RelayTransport for QuicRelayTransport {
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.send_frame(RelayFrame::Subscribe {
            topic: topic.to_owned(),
        })
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        self.send_frame(RelayFrame::Unsubscribe {
            topic: topic.to_owned(),
        })
        .await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        self.send_frame(RelayFrame::Publish {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
        })
        .await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.send.lock().await.finish();
        self.connection.close(0u32.into(), b"bye");
        info!("Relay connection closed");
    }
}

// ---------------------------------------------------------------------------
// Certificate verifier that accepts anything
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
