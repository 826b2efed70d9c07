pub mod ports;

pub mod negotiation;
pub mod peering_session;
pub mod presence;
pub mod signaling_channel;
pub mod signaling_client;
pub mod transfer;
