use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use kvs_webrtc_signalling::{
    client::{SignallingClient, SignallingEvent},
    IceTransportPolicy, RtcConfiguration,
};
use webrtc::{
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        policy::ice_transport_policy::RTCIceTransportPolicy, sdp::session_description::RTCSessionDescription,
    },
    stats::StatsReport,
    track::track_remote::TrackRemote,
    util::vnet::net::Net,
};

use crate::{
    media::{MediaConstraints, MediaSource},
    NoMedia, DEFAULT_STATS_INTERVAL,
};

/// Signalling client exchanging WebRTC session descriptions and candidates
pub type Signalling = SignallingClient<RTCSessionDescription, RTCIceCandidateInit>;
/// Event received over [`Signalling`]
pub type SignalEvent = SignallingEvent<RTCSessionDescription, RTCIceCandidateInit>;

/// What a master does with a second offer from a client it already has a connection for
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateOfferPolicy {
    /// Close the existing connection and negotiate a fresh one
    #[default]
    Replace,
    /// Keep the existing connection, ignore the offer
    Reject,
}

/// Which remote stream owns the remote view when more than one arrives
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteStreamPolicy {
    /// The first stream stays in view, later streams are kept but not shown
    #[default]
    KeepFirst,
    /// The newest stream takes over the view
    Replace,
}

/// Events surfaced by a peer session
pub enum SessionEvent {
    /// A remote media track arrived
    RemoteTrack {
        client_id: String,
        track: Arc<TrackRemote>,
        /// Whether the track belongs to the stream currently in the remote view
        in_view: bool,
    },
    /// A message arrived on a data channel opened by the remote peer
    DataMessage { client_id: String, data: Bytes },
    /// Periodic statistics snapshot of a peer connection
    Stats { client_id: String, report: StatsReport },
    PeerStateChange {
        client_id: String,
        state: RTCPeerConnectionState,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteTrack { client_id, track, in_view } => f
                .debug_struct("RemoteTrack")
                .field("client_id", client_id)
                .field("kind", &track.kind())
                .field("in_view", in_view)
                .finish(),
            Self::DataMessage { client_id, data } => f
                .debug_struct("DataMessage")
                .field("client_id", client_id)
                .field("len", &data.len())
                .finish(),
            Self::Stats { client_id, report } => f
                .debug_struct("Stats")
                .field("client_id", client_id)
                .field("reports", &report.reports.len())
                .finish(),
            Self::PeerStateChange { client_id, state } => f
                .debug_struct("PeerStateChange")
                .field("client_id", client_id)
                .field("state", state)
                .finish(),
        }
    }
}

/// Peer session settings
#[derive(Clone)]
pub struct SessionOptions {
    /// Where local audio/video comes from
    pub media: Arc<dyn MediaSource>,
    pub media_constraints: MediaConstraints,
    pub stats_interval: Duration,
    pub duplicate_offer_policy: DuplicateOfferPolicy,
    pub remote_stream_policy: RemoteStreamPolicy,
    /// Virtual network to gather ICE candidates on instead of the host interfaces
    pub vnet: Option<Arc<Net>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            media: Arc::new(NoMedia),
            media_constraints: MediaConstraints::default(),
            stats_interval: DEFAULT_STATS_INTERVAL,
            duplicate_offer_policy: DuplicateOfferPolicy::default(),
            remote_stream_policy: RemoteStreamPolicy::default(),
            vnet: None,
        }
    }
}

impl SessionOptions {
    pub fn set_media(mut self, set: Arc<dyn MediaSource>) -> Self {
        self.media = set;
        self
    }

    pub fn set_media_constraints(mut self, set: MediaConstraints) -> Self {
        self.media_constraints = set;
        self
    }

    pub fn set_stats_interval(mut self, set: Duration) -> Self {
        self.stats_interval = set;
        self
    }

    pub fn set_duplicate_offer_policy(mut self, set: DuplicateOfferPolicy) -> Self {
        self.duplicate_offer_policy = set;
        self
    }

    pub fn set_remote_stream_policy(mut self, set: RemoteStreamPolicy) -> Self {
        self.remote_stream_policy = set;
        self
    }

    pub fn set_vnet(mut self, set: Arc<Net>) -> Self {
        self.vnet = Some(set);
        self
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("media_constraints", &self.media_constraints)
            .field("stats_interval", &self.stats_interval)
            .field("duplicate_offer_policy", &self.duplicate_offer_policy)
            .field("remote_stream_policy", &self.remote_stream_policy)
            .field("vnet", &self.vnet.is_some())
            .finish_non_exhaustive()
    }
}

/// Received remote tracks, grouped by stream, with one stream selected for the remote view
#[derive(Debug)]
pub struct RemoteStreams<T> {
    policy: RemoteStreamPolicy,
    in_view: Option<String>,
    tracks: Vec<(String, T)>,
}

impl<T: Clone> RemoteStreams<T> {
    pub fn new(policy: RemoteStreamPolicy) -> Self {
        Self {
            policy,
            in_view: None,
            tracks: vec![],
        }
    }

    /// Record a track of stream `stream_key`, returns whether it is now part of the view
    pub fn accept(&mut self, stream_key: String, track: T) -> bool {
        let in_view = match (&self.in_view, self.policy) {
            (None, _) => true,
            (Some(current), _) if current == &stream_key => true,
            (Some(_), RemoteStreamPolicy::KeepFirst) => false,
            (Some(_), RemoteStreamPolicy::Replace) => true,
        };
        if in_view {
            self.in_view = Some(stream_key.clone());
        }
        self.tracks.push((stream_key, track));
        in_view
    }

    /// Tracks of the stream in view
    pub fn view(&self) -> Vec<T> {
        match &self.in_view {
            Some(key) => self
                .tracks
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, track)| track.clone())
                .collect(),
            None => vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Drop every track of streams received from `client_id`
    pub fn remove_client(&mut self, client_id: &str) {
        let prefix = format!("{client_id}/");
        self.tracks.retain(|(key, _)| !key.starts_with(&prefix));
        if self.in_view.as_ref().is_some_and(|key| key.starts_with(&prefix)) {
            self.in_view = None;
        }
    }

    pub fn clear(&mut self) {
        self.in_view = None;
        self.tracks.clear();
    }
}

/// Key identifying a remote stream across every peer of a session
pub fn stream_key(client_id: &str, stream_id: &str) -> String {
    format!("{client_id}/{stream_id}")
}

/// Convert a signalling channel configuration into a peer connection configuration
pub fn rtc_configuration(config: &RtcConfiguration) -> RTCConfiguration {
    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    let ice_transport_policy = match config.ice_transport_policy {
        IceTransportPolicy::All => RTCIceTransportPolicy::All,
        IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
    };
    RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        ..Default::default()
    }
}
