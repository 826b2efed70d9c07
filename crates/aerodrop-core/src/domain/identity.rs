//! Identifiers and room-key value types.
//!
//! These are **pure data**, apart from the optional identity file used by
//! [`Identity::load_or_create`].

use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::unix_millis;

/// Length in bytes of an encoded [`Identity`]. Every relayed frame starts
/// with the sender's identity, so this length is part of the wire format.
pub const IDENTITY_LEN: usize = 32;

/// Prefix mixed into every room passphrase.
const PASSPHRASE_PREFIX: &str = "Areodrop";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Random per-process token: 32 lowercase hex characters.
///
/// Used both as the sender tag of relayed frames and as the suffix of the
/// peer's private topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts exactly [`IDENTITY_LEN`] ASCII hex digits.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == IDENTITY_LEN && s.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reuse the identity stored at `path` if it is younger than `expiry`,
    /// otherwise generate a fresh one and persist it.
    pub fn load_or_create(path: &Path, expiry: Duration) -> anyhow::Result<Self> {
        let now = unix_millis();
        if let Ok(raw) = std::fs::read_to_string(path) {
            match serde_json::from_str::<StoredIdentity>(&raw) {
                Ok(stored) if now.saturating_sub(stored.created_at) < expiry.as_millis() as u64 => {
                    return Ok(stored.id);
                }
                Ok(_) => tracing::debug!(path = %path.display(), "Stored identity expired"),
                Err(e) => tracing::warn!(path = %path.display(), "Ignoring unreadable identity file: {e}"),
            }
        }

        let id = Self::generate();
        let stored = StoredIdentity {
            id: id.clone(),
            created_at: now,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(&stored)?)?;
        Ok(id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid identity {value:?}"))
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    id: Identity,
    created_at: u64,
}

// ---------------------------------------------------------------------------
// Room key
// ---------------------------------------------------------------------------

/// `(roomId, passkey)` pair shared out of band.
///
/// Two clients land on the same topic and derive the same key iff they hold
/// the same pair on the same calendar day.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub room_id: String,
    pub passkey: String,
}

impl RoomKey {
    pub fn new(room_id: impl Into<String>, passkey: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            passkey: passkey.into(),
        }
    }

    /// Broadcast topic for `date`: `prefix + hex(sha256(roomId + coarseDate))`.
    pub fn topic(&self, prefix: &str, date: NaiveDate) -> String {
        let digest = Sha256::digest(format!("{}{}", self.room_id, coarse_date(date)));
        format!("{prefix}{}", hex::encode(digest))
    }

    /// Passphrase fed to the key derivation.
    pub fn passphrase(&self) -> String {
        let room_hash = hex::encode(Sha256::digest(self.room_id.as_bytes()));
        format!("{PASSPHRASE_PREFIX}{room_hash}{}", self.passkey)
    }
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKey")
            .field("room_id", &self.room_id)
            .field("passkey", &"***")
            .finish()
    }
}

/// Private topic of `id` inside the room whose broadcast topic is `topic`.
pub fn direct_topic(topic: &str, id: &Identity) -> String {
    format!("{topic}_{id}")
}

/// Two-digit year, zero-based month and day of month, concatenated without
/// padding. Topics rotate when this string changes.
fn coarse_date(date: NaiveDate) -> String {
    format!("{:02}{}{}", date.year().rem_euclid(100), date.month0(), date.day())
}

// ---------------------------------------------------------------------------
// Device tag
// ---------------------------------------------------------------------------

/// Coarse device class announced in presence packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTag {
    Mobile,
    Desktop,
}

impl DeviceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mobile" => Some(Self::Mobile),
            "desktop" => Some(Self::Desktop),
            _ => None,
        }
    }
}

impl Default for DeviceTag {
    fn default() -> Self {
        Self::Desktop
    }
}
