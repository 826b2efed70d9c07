//! aerodrop-core: find devices in a shared room and swap files with them.
//!
//! # Architecture (Clean Architecture)
//!
//! - **domain**: wire packets, identities, presence registry (no I/O).
//! - **application**: use cases + port traits. The signaling client runs
//!   discovery and connection negotiation over an encrypted relay, the
//!   peering session owns the resulting direct link.
//! - **adapters**: QUIC relay (Quinn), AES-GCM cipher box, in-memory
//!   relay and loopback direct transport, file sources.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;

pub use application::peering_session::{PeeringEvent, PeeringHandle, PeeringSession, PeeringState};
pub use application::signaling_client::{SignalingClient, SignalingEvent, SignalingHandle};
pub use config::{PeeringConfig, SignalingConfig};
pub use domain::error::AerodropError;
pub use domain::identity::{Identity, RoomKey};
