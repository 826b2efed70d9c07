//! Crypto adapters.

pub mod cipher_box;
