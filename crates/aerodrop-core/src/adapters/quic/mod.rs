//! Publish/subscribe relay over QUIC (Quinn).

pub mod client;
pub mod codec;
pub mod server;
