//! Presence protocol: Hello/Welcome/Leave over the room topic.
//!
//! Stateless per message; the only state is the [`PresenceRegistry`] this
//! protocol owns and exposes read-only.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::identity::{DeviceTag, Identity};
use crate::domain::presence::{Peer, PresenceRegistry};
use crate::domain::signaling::{Announcement, BroadcastPacket};

use super::signaling_channel::SignalingChannel;

pub struct PresenceProtocol {
    identity: Identity,
    name: String,
    device: DeviceTag,
    joined_at: u64,
    disconnect_threshold: Duration,
    registry: PresenceRegistry,
}

impl PresenceProtocol {
    pub fn new(
        identity: Identity,
        name: impl Into<String>,
        device: DeviceTag,
        disconnect_threshold: Duration,
    ) -> Self {
        Self {
            identity,
            name: name.into(),
            device,
            joined_at: crate::domain::unix_millis(),
            disconnect_threshold,
            registry: PresenceRegistry::new(),
        }
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Forget every peer and restart the join clock, for a new room.
    pub fn reset(&mut self, now: u64) {
        self.registry.clear();
        self.joined_at = now;
    }

    fn announcement(&self) -> Announcement {
        Announcement {
            id: self.identity.clone(),
            name: self.name.clone(),
            device: self.device,
            joined_at: Some(self.joined_at),
        }
    }

    pub async fn announce_hello(&self, channel: &mut SignalingChannel) -> anyhow::Result<()> {
        debug!("Broadcasting Hello");
        channel
            .broadcast(&BroadcastPacket::Hello(self.announcement()).encode())
            .await
    }

    pub async fn announce_welcome(&self, channel: &mut SignalingChannel) -> anyhow::Result<()> {
        channel
            .broadcast(&BroadcastPacket::Welcome(self.announcement()).encode())
            .await
    }

    pub async fn announce_leave(&self, channel: &mut SignalingChannel) -> anyhow::Result<()> {
        debug!("Broadcasting Leave");
        channel
            .broadcast(&BroadcastPacket::Leave(self.identity.clone()).encode())
            .await
    }

    /// Apply one decrypted room broadcast received at `now`.
    ///
    /// Returns whether the peer list changed. Malformed or spoofed packets
    /// are logged and dropped; only a failure to send our own `Welcome`
    /// reply is an error.
    pub async fn handle_broadcast(
        &mut self,
        channel: &mut SignalingChannel,
        from: &Identity,
        data: &str,
        now: u64,
    ) -> anyhow::Result<bool> {
        let packet = match BroadcastPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %from, "Dropping broadcast: {e}");
                return Ok(false);
            }
        };
        if *from == self.identity || *packet.sender() == self.identity {
            return Ok(false);
        }
        if packet.sender() != from {
            warn!(peer = %from, claimed = %packet.sender(), "Dropping broadcast with a spoofed sender");
            return Ok(false);
        }

        match packet {
            BroadcastPacket::Hello(announcement) => {
                let changed = self.upsert(announcement, now);
                // Their first envelope carried their salt; ours must too.
                channel.reannounce_salt();
                self.announce_welcome(channel).await?;
                Ok(changed)
            }
            BroadcastPacket::Welcome(announcement) => Ok(self.upsert(announcement, now)),
            BroadcastPacket::Leave(id) => {
                let removed = self.registry.remove(&id).is_some();
                if removed {
                    info!(peer = %id, "Peer left");
                }
                Ok(removed)
            }
        }
    }

    /// Evict peers silent for longer than the disconnect threshold.
    pub fn sweep(&mut self, now: u64) -> bool {
        let changed = self
            .registry
            .sweep(now, self.disconnect_threshold.as_millis() as u64);
        if changed {
            debug!(remaining = self.registry.len(), "Swept stale peers");
        }
        changed
    }

    fn upsert(&mut self, announcement: Announcement, now: u64) -> bool {
        let peer = Peer {
            id: announcement.id,
            name: announcement.name,
            device: announcement.device,
            joined_at: announcement.joined_at.unwrap_or(now),
            last_seen: now,
        };
        let id = peer.id.clone();
        let outcome = self.registry.upsert(peer);
        if outcome.changed() {
            info!(peer = %id, ?outcome, "Peer announced");
        }
        outcome.changed()
    }
}
