//! Concrete implementations of the application ports.

pub mod crypto;
pub mod files;
pub mod loopback;
pub mod memory_relay;
pub mod quic;
