//! Peer connection construction and per-connection negotiation state

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use futures_util::{pin_mut, select, FutureExt};
use kvs_webrtc_signalling::Role;
use log::{debug, error, info, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder, API,
    },
    data_channel::{data_channel_message::DataChannelMessage, RTCDataChannel},
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver, RTCRtpTransceiverInit,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    media::LocalMedia,
    types::{SessionEvent, SignalEvent, Signalling},
    SessionError, SessionOptions, DATA_CHANNEL_LABEL,
};

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Peer events that need the session to act on them
pub(crate) enum PeerMessage {
    LocalCandidate {
        client_id: String,
        candidate: RTCIceCandidateInit,
    },
    RemoteTrack {
        client_id: String,
        track: Arc<TrackRemote>,
    },
}

/// Whichever of the two session inputs is ready first
pub(crate) enum Next {
    Signal(Option<SignalEvent>),
    Peer(PeerMessage),
    Idle,
}

pub(crate) async fn next_input(signalling: &Signalling, internal_rx: &flume::Receiver<PeerMessage>) -> Next {
    let signal = signalling.next_event().fuse();
    let internal = internal_rx.recv_async().fuse();
    pin_mut!(signal, internal);
    select! {
        event = signal => Next::Signal(event),
        message = internal => match message {
            Ok(message) => Next::Peer(message),
            Err(_) => Next::Idle,
        },
    }
}

/// Build the WebRTC API with the default codecs and interceptors
pub(crate) fn build_api(options: &SessionOptions) -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let mut setting_engine = SettingEngine::default();
    if let Some(vnet) = &options.vnet {
        setting_engine.set_vnet(Some(vnet.clone()));
    }
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

fn handle_peer_connection_state_change(
    role: Role,
    client_id: &str,
    state: RTCPeerConnectionState,
    events_tx: &flume::Sender<SessionEvent>,
) -> HandlerFuture {
    if state == RTCPeerConnectionState::Failed {
        error!("[{role}] Peer connection failed for client: {client_id}");
    } else {
        debug!("[{role}] Peer connection state has changed for client {client_id}: {state}");
    }
    let event = SessionEvent::PeerStateChange {
        client_id: client_id.to_string(),
        state,
    };
    if events_tx.send(event).is_err() {
        trace!("session event receiver dropped");
    }
    Box::pin(async {})
}

fn handle_ice_candidate(
    role: Role,
    client_id: &str,
    candidate: Option<RTCIceCandidate>,
    internal_tx: &flume::Sender<PeerMessage>,
) -> HandlerFuture {
    match candidate.map(|candidate| candidate.to_json()) {
        Some(Ok(candidate)) => {
            debug!("[{role}] Generated ICE candidate for client: {client_id}");
            let message = PeerMessage::LocalCandidate {
                client_id: client_id.to_string(),
                candidate,
            };
            if internal_tx.send(message).is_err() {
                trace!("session dropped before candidate could be sent");
            }
        }
        Some(Err(e)) => error!("[{role}] Failed to serialise ICE candidate! ({e})"),
        None => info!("[{role}] All ICE candidates have been generated for client: {client_id}"),
    }
    Box::pin(async {})
}

fn handle_track(
    role: Role,
    client_id: &str,
    track: Arc<TrackRemote>,
    internal_tx: &flume::Sender<PeerMessage>,
) -> HandlerFuture {
    info!("[{role}] Received remote track from client: {client_id}");
    let message = PeerMessage::RemoteTrack {
        client_id: client_id.to_string(),
        track,
    };
    if internal_tx.send(message).is_err() {
        trace!("session dropped before track could be delivered");
    }
    Box::pin(async {})
}

fn handle_data_channel(
    role: Role,
    client_id: &str,
    channel: Arc<RTCDataChannel>,
    events_tx: &flume::Sender<SessionEvent>,
) -> HandlerFuture {
    debug!("[{role}] New data channel from client {client_id} ({}:{})", channel.label(), channel.id());
    let client_id = client_id.to_string();
    let events_tx = events_tx.clone();
    channel.on_message(Box::new(move |message| {
        handle_data_channel_message(&client_id, message, &events_tx)
    }));
    Box::pin(async {})
}

fn handle_data_channel_message(
    client_id: &str,
    message: DataChannelMessage,
    events_tx: &flume::Sender<SessionEvent>,
) -> HandlerFuture {
    trace!("data channel message from client {client_id} ({} bytes)", message.data.len());
    let event = SessionEvent::DataMessage {
        client_id: client_id.to_string(),
        data: message.data,
    };
    if events_tx.send(event).is_err() {
        trace!("session event receiver dropped");
    }
    Box::pin(async {})
}

/// Builds a peer connection for one remote client, wired to a session's channels
pub(crate) struct PeerConnectionBuilder<'a> {
    api: &'a API,
    role: Role,
    remote_id: String,
    config: RTCConfiguration,
}

impl<'a> PeerConnectionBuilder<'a> {
    pub(crate) fn new(api: &'a API, role: Role, remote_id: impl Into<String>) -> Self {
        Self {
            api,
            role,
            remote_id: remote_id.into(),
            config: RTCConfiguration::default(),
        }
    }

    /// Specify internal WebRTC peer configuration settings
    pub(crate) fn set_config(mut self, set: RTCConfiguration) -> Self {
        self.config = set;
        self
    }

    pub(crate) async fn build(
        self,
        events_tx: &flume::Sender<SessionEvent>,
        internal_tx: &flume::Sender<PeerMessage>,
    ) -> Result<PeerEntry, SessionError> {
        let Self {
            api,
            role,
            remote_id,
            config,
        } = self;
        let connection = Arc::new(api.new_peer_connection(config).await?);

        let (id, tx) = (remote_id.clone(), events_tx.clone());
        connection.on_peer_connection_state_change(Box::new(move |state| {
            handle_peer_connection_state_change(role, &id, state, &tx)
        }));
        let (id, tx) = (remote_id.clone(), internal_tx.clone());
        connection.on_ice_candidate(Box::new(move |candidate| handle_ice_candidate(role, &id, candidate, &tx)));
        let (id, tx) = (remote_id.clone(), internal_tx.clone());
        connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                handle_track(role, &id, track, &tx)
            },
        ));
        let (id, tx) = (remote_id.clone(), events_tx.clone());
        connection.on_data_channel(Box::new(move |channel| handle_data_channel(role, &id, channel, &tx)));

        let data_channel = match connection.create_data_channel(DATA_CHANNEL_LABEL, None).await {
            Ok(data_channel) => data_channel,
            Err(e) => {
                if let Err(e) = connection.close().await {
                    debug!("[{role}] failed to close peer connection ({e})");
                }
                return Err(e.into());
            }
        };

        Ok(PeerEntry {
            role,
            remote_id,
            connection,
            data_channel,
            pending_candidates: vec![],
        })
    }
}

/// A peer connection paired with its data channel, plus candidates waiting for a remote description
pub(crate) struct PeerEntry {
    role: Role,
    remote_id: String,
    pub(crate) connection: Arc<RTCPeerConnection>,
    pub(crate) data_channel: Arc<RTCDataChannel>,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl PeerEntry {
    /// Send local tracks on this connection
    pub(crate) async fn add_local_media(&self, media: &LocalMedia) -> Result<(), SessionError> {
        for track in media.tracks() {
            let sender = self.connection.add_track(track.clone()).await?;
            // drain RTCP so interceptors keep running
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    /// Request reception of audio and video, for kinds not already sent by local media
    pub(crate) async fn ensure_receiving(&self, media: Option<&LocalMedia>) -> Result<(), SessionError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            if media.is_some_and(|media| media.has_kind(kind)) {
                continue;
            }
            self.connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn create_offer(&self) -> Result<RTCSessionDescription, SessionError> {
        let offer = self.connection.create_offer(None).await?;
        self.connection.set_local_description(offer).await?;
        self.connection
            .local_description()
            .await
            .ok_or(SessionError::NoLocalDescription)
    }

    pub(crate) async fn create_answer(&self) -> Result<RTCSessionDescription, SessionError> {
        let answer = self.connection.create_answer(None).await?;
        self.connection.set_local_description(answer).await?;
        self.connection
            .local_description()
            .await
            .ok_or(SessionError::NoLocalDescription)
    }

    /// Apply the remote description, then any candidates that arrived ahead of it
    pub(crate) async fn apply_remote_description(
        &mut self,
        description: RTCSessionDescription,
    ) -> Result<(), SessionError> {
        self.connection.set_remote_description(description).await?;
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(
                "[{}] Applying {} buffered ICE candidates for client: {}",
                self.role,
                pending.len(),
                self.remote_id
            );
        }
        for candidate in pending {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!(
                    "[{}] Dropping buffered ICE candidate for client {}! ({e})",
                    self.role, self.remote_id
                );
            }
        }
        Ok(())
    }

    /// Add a remote candidate, buffering it until a remote description exists
    pub(crate) async fn add_ice_candidate(&mut self, candidate: RTCIceCandidateInit) -> Result<(), SessionError> {
        if self.connection.remote_description().await.is_none() {
            debug!("[{}] Buffering early ICE candidate for client: {}", self.role, self.remote_id);
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub(crate) fn buffer_candidates(&mut self, candidates: Vec<RTCIceCandidateInit>) {
        self.pending_candidates.extend(candidates);
    }

    pub(crate) fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub(crate) fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub(crate) async fn send_data(&self, data: &Bytes) -> Result<(), SessionError> {
        self.data_channel.send(data).await?;
        Ok(())
    }

    pub(crate) async fn close(self) {
        if let Err(e) = self.connection.close().await {
            warn!("[{}] Failed to close peer connection for client {} ({e})", self.role, self.remote_id);
        }
    }
}
