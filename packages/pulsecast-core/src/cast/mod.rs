//! The Chromecast control channel.
//!
//! - [`wire`]: the CastMessage envelope and length-prefixed framing
//! - [`connection`]: one TCP+TLS connection to a device
//! - [`protocol`]: JSON payloads of the cast sub-protocols
//! - [`channel`]: logical channels multiplexed over a connection

pub mod channel;
pub mod connection;
pub mod protocol;
pub mod wire;

pub use connection::{CastConnection, ConnectionEvent};
pub use wire::{CastMessage, PayloadType};
