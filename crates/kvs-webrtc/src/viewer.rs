//! Viewer peer session: a single peer connection to the master

use std::sync::Arc;

use bytes::Bytes;
use kvs_webrtc_signalling::{
    client::{fetch_config, Signal, SignallingEvent, SignallingState},
    ChannelConfig, Role, RtcConfiguration, MASTER_CLIENT_ID,
};
use log::{debug, error, info, warn};
use webrtc::{
    api::API,
    peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
    track::track_remote::TrackRemote,
};

use crate::{
    media::LocalMedia,
    peer::{build_api, next_input, Next, PeerConnectionBuilder, PeerEntry, PeerMessage},
    stats::StatsPoller,
    types::{rtc_configuration, stream_key, RemoteStreams, SignalEvent, Signalling},
    SessionError, SessionEvent, SessionOptions,
};

/// Viewer side of a signalling channel
///
/// The peer connection is created as soon as the session starts. Local media is requested
/// once signalling opens, after which the offer goes out whether or not media was found.
pub struct ViewerSession {
    options: SessionOptions,
    api: Option<API>,
    client_id: Option<String>,
    signalling: Option<Signalling>,
    peer: Option<PeerEntry>,
    local_media: Option<LocalMedia>,
    remote_streams: RemoteStreams<Arc<TrackRemote>>,
    stats: StatsPoller,
    events_tx: flume::Sender<SessionEvent>,
    events_rx: flume::Receiver<SessionEvent>,
    internal_tx: flume::Sender<PeerMessage>,
    internal_rx: flume::Receiver<PeerMessage>,
}

impl ViewerSession {
    pub fn new(options: SessionOptions) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (internal_tx, internal_rx) = flume::unbounded();
        Self {
            remote_streams: RemoteStreams::new(options.remote_stream_policy),
            stats: StatsPoller::new(options.stats_interval),
            options,
            api: None,
            client_id: None,
            signalling: None,
            peer: None,
            local_media: None,
            events_tx,
            events_rx,
            internal_tx,
            internal_rx,
        }
    }

    /// Fetch a viewer configuration from a config server and start
    pub async fn start(&mut self, server_url: &str) -> Result<(), SessionError> {
        if self.is_started() {
            return Err(SessionError::AlreadyStarted);
        }
        let config = fetch_config(server_url, Role::Viewer).await?;
        self.start_with_config(config).await
    }

    pub async fn start_with_config(&mut self, config: ChannelConfig) -> Result<(), SessionError> {
        if self.is_started() {
            return Err(SessionError::AlreadyStarted);
        }
        info!("[VIEWER] Channel ARN: {} (client id {})", config.channel_arn, config.client_id);
        self.prepare(&config.configuration).await?;
        self.client_id = Some(config.client_id);
        let mut signalling = Signalling::new(config.url, Role::Viewer);
        info!("[VIEWER] Starting viewer connection");
        if let Err(e) = signalling.open() {
            self.stop().await;
            return Err(e.into());
        }
        self.signalling = Some(signalling);
        Ok(())
    }

    /// Create the peer connection and start statistics, everything but signalling
    pub(crate) async fn prepare(&mut self, configuration: &RtcConfiguration) -> Result<(), SessionError> {
        let api = build_api(&self.options)?;
        let entry = PeerConnectionBuilder::new(&api, Role::Viewer, MASTER_CLIENT_ID)
            .set_config(rtc_configuration(configuration))
            .build(&self.events_tx, &self.internal_tx)
            .await?;
        self.stats.watch(MASTER_CLIENT_ID, entry.connection.clone());
        self.stats.start(self.events_tx.clone());
        self.peer = Some(entry);
        self.api = Some(api);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.api.is_some()
    }

    /// Process the next signalling or peer event.
    ///
    /// Returns `Ok(false)` once the signalling channel has closed.
    pub async fn step(&mut self) -> Result<bool, SessionError> {
        let signalling = self.signalling.as_ref().ok_or(SessionError::NotStarted)?;
        match next_input(signalling, &self.internal_rx).await {
            Next::Signal(None) => return Ok(false),
            Next::Signal(Some(event)) => {
                if let Err(e) = self.handle_signal(event).await {
                    error!("[VIEWER] {e}");
                }
            }
            Next::Peer(message) => self.handle_peer_message(message),
            Next::Idle => {}
        }
        Ok(true)
    }

    /// Dispatch one signalling event
    pub async fn handle_signal(&mut self, event: SignalEvent) -> Result<(), SessionError> {
        match event {
            SignallingEvent::Open => self.handle_open().await?,
            SignallingEvent::SdpAnswer(Signal { payload, .. }) => {
                info!("[VIEWER] Received SDP answer");
                let peer = self.peer.as_mut().ok_or(SessionError::NotStarted)?;
                peer.apply_remote_description(payload).await?;
            }
            SignallingEvent::IceCandidate(Signal { payload, .. }) => {
                debug!("[VIEWER] Received ICE candidate");
                let peer = self.peer.as_mut().ok_or(SessionError::NotStarted)?;
                peer.add_ice_candidate(payload).await?;
            }
            SignallingEvent::SdpOffer(_) => warn!("[VIEWER] Ignoring unexpected SDP offer"),
            SignallingEvent::Status(status) => {
                warn!("[VIEWER] Signaling service rejected a message ({status:?})")
            }
            SignallingEvent::Close => info!("[VIEWER] Disconnected from signaling channel"),
            SignallingEvent::Error(e) => error!("[VIEWER] Signaling client error ({e})"),
        }
        Ok(())
    }

    async fn handle_open(&mut self) -> Result<(), SessionError> {
        info!("[VIEWER] Connected to signaling service");
        let peer = self.peer.as_ref().ok_or(SessionError::NotStarted)?;
        if self.local_media.is_none() {
            match self.options.media.acquire(&self.options.media_constraints) {
                Ok(media) => {
                    peer.add_local_media(&media).await?;
                    self.local_media = Some(media);
                }
                Err(e) => error!("[VIEWER] Could not find webcam ({e})"),
            }
        }
        peer.ensure_receiving(self.local_media.as_ref()).await?;

        info!("[VIEWER] Creating SDP offer");
        let offer = peer.create_offer().await?;
        match &self.signalling {
            Some(signalling) => {
                info!("[VIEWER] Sending SDP offer");
                signalling.send_sdp_offer(&offer, None)?;
                info!("[VIEWER] Generating ICE candidates");
            }
            None => warn!("[VIEWER] No signalling connection, offer not sent"),
        }
        Ok(())
    }

    fn handle_peer_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::LocalCandidate { candidate, .. } => {
                let Some(signalling) = &self.signalling else {
                    debug!("[VIEWER] No signalling connection, dropping ICE candidate");
                    return;
                };
                debug!("[VIEWER] Sending ICE candidate");
                if let Err(e) = signalling.send_ice_candidate(&candidate, None) {
                    warn!("[VIEWER] Failed to send ICE candidate! ({e})");
                }
            }
            PeerMessage::RemoteTrack { client_id, track } => {
                let in_view = self
                    .remote_streams
                    .accept(stream_key(&client_id, &track.stream_id()), track.clone());
                let event = SessionEvent::RemoteTrack {
                    client_id,
                    track,
                    in_view,
                };
                if self.events_tx.send(event).is_err() {
                    debug!("[VIEWER] session event receiver dropped");
                }
            }
        }
    }

    /// Send bytes to the master over the data channel
    pub async fn send_data(&self, data: Bytes) -> Result<(), SessionError> {
        let peer = self.peer.as_ref().ok_or(SessionError::NotStarted)?;
        peer.send_data(&data).await
    }

    /// Tear down everything. Safe to call repeatedly, or without ever starting.
    pub async fn stop(&mut self) {
        info!("[VIEWER] Stopping viewer connection");
        if let Some(mut signalling) = self.signalling.take() {
            signalling.close().await;
        }
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        self.remote_streams.clear();
        self.stats.stop();
        self.client_id = None;
        self.api = None;
        self.internal_rx.drain().for_each(drop);
    }

    /// Session events (remote tracks, data messages, statistics, connection state)
    pub fn events(&self) -> flume::Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    /// Client ID assigned by the config endpoint
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn signalling_state(&self) -> Option<SignallingState> {
        self.signalling.as_ref().map(|signalling| signalling.state())
    }

    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.peer.as_ref().map(|peer| peer.connection.clone())
    }

    pub fn peer_state(&self) -> Option<RTCPeerConnectionState> {
        self.peer.as_ref().map(|peer| peer.connection.connection_state())
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    /// Tracks of the remote stream currently in view
    pub fn remote_view(&self) -> Vec<Arc<TrackRemote>> {
        self.remote_streams.view()
    }

    pub fn is_stats_running(&self) -> bool {
        self.stats.is_running()
    }
}
