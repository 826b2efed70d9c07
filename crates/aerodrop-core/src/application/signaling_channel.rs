//! Encrypted room and direct messaging over a [`RelayTransport`].
//!
//! A joined room is two subscriptions: the broadcast topic derived from the
//! [`RoomKey`] and the private topic `topic_<identity>`. Every frame is
//! `senderId || envelope`, where the envelope comes from the room's
//! [`CipherBox`].

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::adapters::crypto::cipher_box::CipherBox;
use crate::config::CipherConfig;
use crate::domain::error::{AerodropError, DecryptError};
use crate::domain::identity::{direct_topic, Identity, RoomKey, IDENTITY_LEN};
use crate::domain::signaling::{peek_tag, tags, SignalingPacket};

use super::ports::{RelayEvent, RelayTransport};

/// What a relay event meant, after decryption and classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Connected,
    /// Published on the room topic.
    Broadcast { from: Identity, data: String },
    /// Published on our private topic.
    Direct { from: Identity, data: String },
    DecryptFailed { from: Identity, error: DecryptError },
    TransportError(String),
    Disconnected(String),
}

struct JoinedRoom {
    key: RoomKey,
    topic: String,
    direct_topic: String,
    cipher: CipherBox,
}

pub struct SignalingChannel {
    relay: Arc<dyn RelayTransport>,
    identity: Identity,
    topic_prefix: String,
    cipher_config: CipherConfig,
    room: Option<JoinedRoom>,
    /// Senders we already asked for their salt.
    resalt_pending: HashSet<Identity>,
}

impl SignalingChannel {
    pub fn new(
        relay: Arc<dyn RelayTransport>,
        identity: Identity,
        topic_prefix: impl Into<String>,
        cipher_config: CipherConfig,
    ) -> Self {
        Self {
            relay,
            identity,
            topic_prefix: topic_prefix.into(),
            cipher_config,
            room: None,
            resalt_pending: HashSet::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Broadcast topic of the joined room.
    pub fn topic(&self) -> Option<&str> {
        self.room.as_ref().map(|r| r.topic.as_str())
    }

    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref().map(|r| &r.key)
    }

    /// Join the room for `key`, leaving the current one first if it differs.
    /// Returns `false` if `key` was already joined.
    pub async fn subscribe_room(&mut self, key: &RoomKey) -> anyhow::Result<bool> {
        let topic = key.topic(&self.topic_prefix, Utc::now().date_naive());
        if let Some(room) = &self.room {
            if room.key == *key && room.topic == topic {
                return Ok(false);
            }
        }
        self.leave_room().await?;

        let private = direct_topic(&topic, &self.identity);
        self.relay.subscribe(&topic).await?;
        self.relay.subscribe(&private).await?;
        info!(room = %key.room_id, %topic, "Joined room");

        self.room = Some(JoinedRoom {
            key: key.clone(),
            topic,
            direct_topic: private,
            cipher: CipherBox::with_config(&key.passphrase(), &self.cipher_config),
        });
        Ok(true)
    }

    pub async fn leave_room(&mut self) -> anyhow::Result<()> {
        self.resalt_pending.clear();
        let Some(room) = self.room.take() else {
            return Ok(());
        };
        self.relay.unsubscribe(&room.topic).await?;
        self.relay.unsubscribe(&room.direct_topic).await?;
        info!(room = %room.key.room_id, "Left room");
        Ok(())
    }

    /// Encrypt `payload` and publish it to the room, or to `to`'s private topic.
    pub async fn send(&mut self, payload: &str, to: Option<&Identity>) -> anyhow::Result<()> {
        let room = self
            .room
            .as_mut()
            .ok_or(AerodropError::Closed("signaling room"))?;
        let envelope = room.cipher.encrypt(payload)?;
        let topic = match to {
            Some(peer) => direct_topic(&room.topic, peer),
            None => room.topic.clone(),
        };

        let mut frame = BytesMut::with_capacity(IDENTITY_LEN + envelope.len());
        frame.put_slice(self.identity.as_str().as_bytes());
        frame.put_slice(envelope.as_bytes());
        trace!(%topic, bytes = frame.len(), "Publishing");
        self.relay.publish(&topic, frame.freeze()).await
    }

    pub async fn broadcast(&mut self, payload: &str) -> anyhow::Result<()> {
        self.send(payload, None).await
    }

    /// Put our salt in the next envelope.
    pub fn reannounce_salt(&mut self) {
        if let Some(room) = &mut self.room {
            room.cipher.reannounce_salt();
        }
    }

    /// Decrypt and classify one relay event. `None` means the event was
    /// consumed here (own echo, stale topic, salt recovery, garbage).
    pub async fn handle_relay_event(&mut self, event: RelayEvent) -> Option<Inbound> {
        match event {
            RelayEvent::Connected => Some(Inbound::Connected),
            RelayEvent::Error(e) => Some(Inbound::TransportError(e)),
            RelayEvent::Disconnected(reason) => Some(Inbound::Disconnected(reason)),
            RelayEvent::Message { topic, payload } => self.handle_message(&topic, payload).await,
        }
    }

    async fn handle_message(&mut self, topic: &str, payload: Bytes) -> Option<Inbound> {
        let Some(room) = self.room.as_mut() else {
            trace!(%topic, "Dropping message received outside a room");
            return None;
        };
        let direct = if topic == room.topic {
            false
        } else if topic == room.direct_topic {
            true
        } else {
            trace!(%topic, "Dropping message for a stale topic");
            return None;
        };

        if payload.len() < IDENTITY_LEN {
            warn!(%topic, "Dropping frame shorter than a sender id");
            return None;
        }
        let (sender, envelope) = payload.split_at(IDENTITY_LEN);
        let Some(from) = std::str::from_utf8(sender).ok().and_then(Identity::parse) else {
            warn!(%topic, "Dropping frame with an invalid sender id");
            return None;
        };
        if from == self.identity {
            return None;
        }
        let Ok(envelope) = std::str::from_utf8(envelope) else {
            warn!(peer = %from, "Dropping frame with a non-text envelope");
            return None;
        };

        match room.cipher.decrypt(&from, envelope) {
            Ok(data) => {
                self.resalt_pending.remove(&from);
                if direct && peek_tag(&data).as_deref() == Some(tags::RESALT) {
                    self.handle_resalt(&from, &data).await;
                    return None;
                }
                trace!(peer = %from, direct, "Received");
                Some(if direct {
                    Inbound::Direct { from, data }
                } else {
                    Inbound::Broadcast { from, data }
                })
            }
            Err(error) => {
                warn!(peer = %from, direct, "Dropping undecryptable message: {error}");
                if error == DecryptError::MissingSalt && self.resalt_pending.insert(from.clone()) {
                    self.request_salt(&from).await;
                }
                Some(Inbound::DecryptFailed { from, error })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Salt recovery
    // -----------------------------------------------------------------------

    async fn request_salt(&mut self, from: &Identity) {
        debug!(peer = %from, "Asking sender to re-announce its salt");
        // They may be missing our salt as well.
        self.reannounce_salt();
        let packet = SignalingPacket::Resalt {
            id: self.identity.clone(),
            reply: false,
        };
        if let Err(e) = self.send(&packet.encode(), Some(from)).await {
            warn!(peer = %from, "Failed to send salt request: {e}");
        }
    }

    async fn handle_resalt(&mut self, from: &Identity, data: &str) {
        let reply = match SignalingPacket::decode(data) {
            Ok(SignalingPacket::Resalt { id, reply }) if id == *from => reply,
            Ok(_) => {
                warn!(peer = %from, "Salt request with a mismatched sender");
                return;
            }
            Err(e) => {
                warn!(peer = %from, "Bad salt request: {e}");
                return;
            }
        };
        if reply {
            debug!(peer = %from, "Salt re-announced by peer");
            return;
        }

        debug!(peer = %from, "Re-announcing salt on request");
        self.reannounce_salt();
        let packet = SignalingPacket::Resalt {
            id: self.identity.clone(),
            reply: true,
        };
        if let Err(e) = self.send(&packet.encode(), Some(from)).await {
            warn!(peer = %from, "Failed to answer salt request: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::adapters::memory_relay::MemoryBroker;

    struct Client {
        channel: SignalingChannel,
        events: mpsc::UnboundedReceiver<RelayEvent>,
    }

    impl Client {
        async fn join(broker: &MemoryBroker, key: &RoomKey) -> Self {
            let relay = broker.connect();
            let events = relay.take_events().unwrap();
            let mut channel = SignalingChannel::new(
                relay,
                Identity::generate(),
                "TEST",
                CipherConfig { kdf_iterations: 1_000 },
            );
            assert!(channel.subscribe_room(key).await.unwrap());
            Self { channel, events }
        }

        fn id(&self) -> Identity {
            self.channel.identity().clone()
        }

        /// Process everything the broker has delivered so far.
        async fn drain(&mut self) -> Vec<Inbound> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let Some(inbound) = self.channel.handle_relay_event(event).await {
                    if inbound != Inbound::Connected {
                        out.push(inbound);
                    }
                }
            }
            out
        }
    }

    fn room() -> RoomKey {
        RoomKey::new("R1", "😀")
    }

    #[tokio::test]
    async fn broadcast_and_direct_are_classified() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        let mut b = Client::join(&broker, &room()).await;

        a.channel.broadcast("hello room").await.unwrap();
        a.channel.send("psst", Some(&b.id())).await.unwrap();

        assert_eq!(
            b.drain().await,
            vec![
                Inbound::Broadcast { from: a.id(), data: "hello room".into() },
                Inbound::Direct { from: a.id(), data: "psst".into() },
            ]
        );
        // Own echo on the room topic is dropped.
        assert!(a.drain().await.is_empty());
    }

    #[tokio::test]
    async fn foreign_passkey_is_reported_and_survived() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        let mut b = Client::join(&broker, &room()).await;
        let mut intruder = Client::join(&broker, &RoomKey::new("R1", "🐸")).await;

        intruder.channel.broadcast("let me in").await.unwrap();
        a.channel.broadcast("still here").await.unwrap();

        let inbound = b.drain().await;
        assert_eq!(inbound.len(), 2);
        assert_eq!(
            inbound[0],
            Inbound::DecryptFailed { from: intruder.id(), error: DecryptError::Authentication }
        );
        assert_eq!(inbound[1], Inbound::Broadcast { from: a.id(), data: "still here".into() });
    }

    #[tokio::test]
    async fn late_joiner_recovers_missing_salt() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        a.channel.broadcast("before anyone listened").await.unwrap();

        let mut b = Client::join(&broker, &room()).await;
        a.channel.broadcast("salt-less").await.unwrap();
        assert_eq!(
            b.drain().await,
            vec![Inbound::DecryptFailed { from: a.id(), error: DecryptError::MissingSalt }]
        );

        // a answers the salt request internally; b learns the salt from the answer.
        assert!(a.drain().await.is_empty());
        assert!(b.drain().await.is_empty());

        a.channel.broadcast("readable again").await.unwrap();
        assert_eq!(
            b.drain().await,
            vec![Inbound::Broadcast { from: a.id(), data: "readable again".into() }]
        );
    }

    #[tokio::test]
    async fn salt_is_requested_once_per_sender() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        a.channel.broadcast("first").await.unwrap();
        let mut b = Client::join(&broker, &room()).await;

        a.channel.broadcast("second").await.unwrap();
        a.channel.broadcast("third").await.unwrap();
        assert_eq!(b.drain().await.len(), 2);
        assert_eq!(b.channel.resalt_pending.len(), 1);
    }

    #[tokio::test]
    async fn leaving_stops_delivery() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        let mut b = Client::join(&broker, &room()).await;

        b.channel.leave_room().await.unwrap();
        assert_eq!(b.channel.topic(), None);
        a.channel.broadcast("anyone?").await.unwrap();
        assert!(b.drain().await.is_empty());

        let err = b.channel.broadcast("hello").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<AerodropError>(),
            Some(&AerodropError::Closed("signaling room"))
        );
    }

    #[tokio::test]
    async fn switching_rooms_resubscribes() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        let mut b = Client::join(&broker, &room()).await;
        let old_topic = b.channel.topic().unwrap().to_owned();

        assert!(!b.channel.subscribe_room(&room()).await.unwrap());
        assert!(b.channel.subscribe_room(&RoomKey::new("R2", "😀")).await.unwrap());
        assert_eq!(broker.subscriber_count(&old_topic), 1);

        a.channel.broadcast("R1 only").await.unwrap();
        assert!(b.drain().await.is_empty());
    }

    #[tokio::test]
    async fn relay_lifecycle_events_pass_through() {
        let broker = MemoryBroker::new();
        let mut a = Client::join(&broker, &room()).await;
        assert_eq!(
            a.channel.handle_relay_event(RelayEvent::Error("boom".into())).await,
            Some(Inbound::TransportError("boom".into()))
        );
        assert_eq!(
            a.channel
                .handle_relay_event(RelayEvent::Disconnected("gone".into()))
                .await,
            Some(Inbound::Disconnected("gone".into()))
        );
        // Garbage frames are dropped silently.
        let topic = a.channel.topic().unwrap().to_owned();
        let garbage = RelayEvent::Message { topic, payload: Bytes::from_static(b"short") };
        assert_eq!(a.channel.handle_relay_event(garbage).await, None);
    }
}
