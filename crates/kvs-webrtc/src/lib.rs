//! Master and viewer WebRTC peer sessions over a Kinesis Video signalling channel
//!
//! A [`MasterSession`] answers every viewer that offers to it, keeping one peer connection per
//! remote client. A [`ViewerSession`] owns a single peer connection to the master. Both are
//! driven by repeatedly calling `step()`, which dispatches one signalling or peer event at a time.

use std::time::Duration;

use kvs_webrtc_signalling::client::ClientError;

pub mod master;
pub mod media;
mod peer;
mod stats;
pub mod types;
pub mod viewer;

pub use master::MasterSession;
pub use media::{LocalMedia, MediaConstraints, MediaError, MediaSource, NoMedia, SyntheticMedia};
pub use types::{DuplicateOfferPolicy, RemoteStreamPolicy, SessionEvent, SessionOptions};
pub use viewer::ViewerSession;

/// Label of the data channel every peer connection creates
pub const DATA_CHANNEL_LABEL: &str = "kvsDataChannel";
/// Default period of statistics snapshots
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Peer session error
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Signalling(#[from] ClientError),
    #[error("Session was already started!")]
    AlreadyStarted,
    #[error("Session is not started!")]
    NotStarted,
    #[error("No peer connection for client {0}!")]
    UnknownPeer(String),
    #[error("Local description unavailable!")]
    NoLocalDescription,
}
