//! Signalling plumbing for Kinesis Video WebRTC channels
//!
//! The `server` feature provides the config endpoint that resolves a channel through the
//! control plane and hands out presigned signalling URLs. The `client` feature provides the
//! WebSocket signalling session used by master and viewer peers.

pub mod types;

#[cfg(feature = "server")]
pub mod config;
#[cfg(feature = "server")]
pub mod control_plane;
#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub mod signer;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
mod message;

pub use types::{ChannelConfig, IceServer, IceTransportPolicy, Role, RtcConfiguration, MASTER_CLIENT_ID};

pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:3003";
