//! In-memory table of peers seen in the current room.

use std::collections::HashMap;

use serde::Serialize;

use super::identity::{DeviceTag, Identity};

/// A remote participant as last announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: Identity,
    pub name: String,
    pub device: DeviceTag,
    /// Join time announced by the peer, used for ordering.
    pub joined_at: u64,
    /// Local receive time of the most recent announcement.
    pub last_seen: u64,
}

/// Result of [`PresenceRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// Same contents, timestamp possibly refreshed.
    Unchanged,
    /// Older than what is stored; ignored.
    Stale,
}

impl Upsert {
    /// Whether the visible peer list changed.
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    peers: HashMap<Identity, Peer>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `peer`, or refresh the stored entry if `peer.last_seen` is not
    /// older than the stored one.
    pub fn upsert(&mut self, peer: Peer) -> Upsert {
        match self.peers.get_mut(&peer.id) {
            None => {
                self.peers.insert(peer.id.clone(), peer);
                Upsert::Inserted
            }
            Some(stored) if peer.last_seen < stored.last_seen => Upsert::Stale,
            Some(stored) => {
                let changed = stored.name != peer.name
                    || stored.device != peer.device
                    || stored.joined_at != peer.joined_at;
                *stored = peer;
                if changed {
                    Upsert::Updated
                } else {
                    Upsert::Unchanged
                }
            }
        }
    }

    pub fn remove(&mut self, id: &Identity) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Drop every peer last seen before `now - threshold`. Returns whether
    /// anything was removed.
    pub fn sweep(&mut self, now: u64, threshold_ms: u64) -> bool {
        let cutoff = now.saturating_sub(threshold_ms);
        let before = self.peers.len();
        self.peers.retain(|_, peer| peer.last_seen >= cutoff);
        self.peers.len() != before
    }

    /// Peers ordered by join time, ties broken by id.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    pub fn get(&self, id: &Identity) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
