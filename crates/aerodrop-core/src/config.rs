//! Tunables with the defaults the protocol runs on.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::identity::{DeviceTag, Identity};

/// PBKDF2 iteration count used by production clients.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// How long a persisted identity stays valid: 24 minutes.
pub const IDENTITY_EXPIRY: Duration = Duration::from_secs(24 * 60);

#[derive(Debug, Clone)]
pub struct CipherConfig {
    pub kdf_iterations: u32,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Takes precedence over `identity_file`.
    pub identity: Option<Identity>,
    /// Reuse the identity stored here while it is younger than
    /// [`IDENTITY_EXPIRY`]. A fresh identity is generated when both are unset.
    pub identity_file: Option<PathBuf>,
    pub display_name: String,
    pub device: DeviceTag,
    /// Prepended to every room topic.
    pub topic_prefix: String,
    /// Per-phase negotiation deadline.
    pub negotiation_timeout: Duration,
    pub sweep_interval: Duration,
    /// Peers not heard from for this long are swept.
    pub disconnect_threshold: Duration,
    /// Period of the keep-alive `Welcome` broadcast.
    pub announce_interval: Duration,
    /// Release the relay after this long without local activity.
    pub idle_timeout: Option<Duration>,
    pub cipher: CipherConfig,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            identity: None,
            identity_file: None,
            display_name: "Anonymous".into(),
            device: DeviceTag::Desktop,
            topic_prefix: "ARDP".into(),
            negotiation_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15),
            disconnect_threshold: Duration::from_secs(5 * 60),
            announce_interval: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(5 * 60)),
            cipher: CipherConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeeringConfig {
    /// Bytes per binary frame on a transfer channel.
    pub chunk_size: usize,
    /// Pause reading when the channel buffers more than this.
    pub buffered_amount_high: usize,
    /// Resume reading once the buffer drains to this.
    pub buffered_amount_low: usize,
    /// A transfer with no frame for this long is abandoned.
    pub transfer_idle_timeout: Duration,
    pub channel_open_timeout: Duration,
    /// When set, completed downloads are written here too.
    pub download_dir: Option<PathBuf>,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            buffered_amount_high: 1024 * 1024,
            buffered_amount_low: 256 * 1024,
            transfer_idle_timeout: Duration::from_secs(30),
            channel_open_timeout: Duration::from_secs(10),
            download_dir: None,
        }
    }
}
