//! Domain layer: protocol types, identifiers and value objects.
//!
//! Nothing in here performs network I/O or spawns tasks.

pub mod error;
pub mod identity;
pub mod peering;
pub mod presence;
pub mod signaling;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn unix_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
