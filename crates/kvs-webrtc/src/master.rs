//! Master peer session: answers every viewer, one peer connection per remote client

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use kvs_webrtc_signalling::{
    client::{fetch_config, Signal, SignallingEvent, SignallingState},
    ChannelConfig, Role, RtcConfiguration,
};
use log::{debug, error, info, warn};
use webrtc::{
    api::API,
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    track::track_remote::TrackRemote,
};

use crate::{
    media::LocalMedia,
    peer::{build_api, next_input, Next, PeerConnectionBuilder, PeerEntry, PeerMessage},
    stats::StatsPoller,
    types::{rtc_configuration, stream_key, RemoteStreams, SignalEvent, Signalling},
    DuplicateOfferPolicy, SessionError, SessionEvent, SessionOptions,
};

/// Candidates kept per client that has not offered yet
const MAX_EARLY_CANDIDATES: usize = 64;
/// Clients without an offer that may have candidates buffered at once
const MAX_EARLY_CLIENTS: usize = 128;

/// Apply a viewer's offer to a fresh connection and produce the answer
async fn answer_offer(
    entry: &mut PeerEntry,
    media: Option<&LocalMedia>,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription, SessionError> {
    if let Some(media) = media {
        entry.add_local_media(media).await?;
    }
    entry.apply_remote_description(offer).await?;
    info!("[MASTER] Creating SDP answer for client: {}", entry.remote_id());
    entry.create_answer().await
}

/// Master side of a signalling channel
///
/// Created idle. [`MasterSession::start`] fetches the channel configuration, acquires local
/// media and opens signalling; [`MasterSession::step`] must then be polled to process events.
pub struct MasterSession {
    options: SessionOptions,
    api: Option<API>,
    rtc_config: Option<RTCConfiguration>,
    signalling: Option<Signalling>,
    local_media: Option<LocalMedia>,
    peers: HashMap<String, PeerEntry>,
    early_candidates: HashMap<String, Vec<RTCIceCandidateInit>>,
    remote_streams: RemoteStreams<Arc<TrackRemote>>,
    stats: StatsPoller,
    events_tx: flume::Sender<SessionEvent>,
    events_rx: flume::Receiver<SessionEvent>,
    internal_tx: flume::Sender<PeerMessage>,
    internal_rx: flume::Receiver<PeerMessage>,
}

impl MasterSession {
    pub fn new(options: SessionOptions) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let (internal_tx, internal_rx) = flume::unbounded();
        Self {
            remote_streams: RemoteStreams::new(options.remote_stream_policy),
            stats: StatsPoller::new(options.stats_interval),
            options,
            api: None,
            rtc_config: None,
            signalling: None,
            local_media: None,
            peers: HashMap::new(),
            early_candidates: HashMap::new(),
            events_tx,
            events_rx,
            internal_tx,
            internal_rx,
        }
    }

    /// Fetch the master configuration from a config server and start
    pub async fn start(&mut self, server_url: &str) -> Result<(), SessionError> {
        if self.is_started() {
            return Err(SessionError::AlreadyStarted);
        }
        let config = fetch_config(server_url, Role::Master).await?;
        self.start_with_config(config).await
    }

    pub async fn start_with_config(&mut self, config: ChannelConfig) -> Result<(), SessionError> {
        if self.is_started() {
            return Err(SessionError::AlreadyStarted);
        }
        info!("[MASTER] Channel ARN: {}", config.channel_arn);
        self.prepare(&config.configuration)?;
        let mut signalling = Signalling::new(config.url, Role::Master);
        info!("[MASTER] Starting master connection");
        if let Err(e) = signalling.open() {
            self.stop().await;
            return Err(e.into());
        }
        self.signalling = Some(signalling);
        Ok(())
    }

    /// Set up everything but signalling
    pub(crate) fn prepare(&mut self, configuration: &RtcConfiguration) -> Result<(), SessionError> {
        self.api = Some(build_api(&self.options)?);
        self.rtc_config = Some(rtc_configuration(configuration));
        match self.options.media.acquire(&self.options.media_constraints) {
            Ok(media) => self.local_media = Some(media),
            Err(e) => error!("[MASTER] Could not find webcam ({e})"),
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.api.is_some()
    }

    /// Process the next signalling or peer event.
    ///
    /// Returns `Ok(false)` once the signalling channel has closed. Failures negotiating with a
    /// single viewer are logged and do not end the session.
    pub async fn step(&mut self) -> Result<bool, SessionError> {
        let signalling = self.signalling.as_ref().ok_or(SessionError::NotStarted)?;
        match next_input(signalling, &self.internal_rx).await {
            Next::Signal(None) => return Ok(false),
            Next::Signal(Some(event)) => {
                if let Err(e) = self.handle_signal(event).await {
                    error!("[MASTER] {e}");
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
            SignallingEvent::Open => info!("[MASTER] Connected to signaling service"),
            SignallingEvent::SdpOffer(Signal {
                payload,
                remote_id: Some(client_id),
            }) => self.handle_offer(client_id, payload).await?,
            SignallingEvent::IceCandidate(Signal {
                payload,
                remote_id: Some(client_id),
            }) => self.handle_remote_candidate(client_id, payload).await?,
            SignallingEvent::SdpOffer(_) | SignallingEvent::IceCandidate(_) => {
                warn!("[MASTER] Ignoring message without a sender client id")
            }
            SignallingEvent::SdpAnswer(_) => warn!("[MASTER] Ignoring unexpected SDP answer"),
            SignallingEvent::Status(status) => {
                warn!("[MASTER] Signaling service rejected a message ({status:?})")
            }
            SignallingEvent::Close => info!("[MASTER] Disconnected from signaling channel"),
            SignallingEvent::Error(e) => error!("[MASTER] Signaling client error ({e})"),
        }
        Ok(())
    }

    async fn handle_offer(&mut self, client_id: String, offer: RTCSessionDescription) -> Result<(), SessionError> {
        info!("[MASTER] Received SDP offer from client: {client_id}");
        if self.peers.contains_key(&client_id) {
            match self.options.duplicate_offer_policy {
                DuplicateOfferPolicy::Reject => {
                    warn!("[MASTER] Ignoring repeated SDP offer from client: {client_id}");
                    return Ok(());
                }
                DuplicateOfferPolicy::Replace => {
                    info!("[MASTER] Replacing peer connection for client: {client_id}");
                    self.remove_peer(&client_id).await;
                }
            }
        }

        let api = self.api.as_ref().ok_or(SessionError::NotStarted)?;
        let config = self.rtc_config.clone().ok_or(SessionError::NotStarted)?;
        let mut entry = PeerConnectionBuilder::new(api, Role::Master, client_id.as_str())
            .set_config(config)
            .build(&self.events_tx, &self.internal_tx)
            .await?;
        if let Some(early) = self.early_candidates.remove(&client_id) {
            entry.buffer_candidates(early);
        }
        // only a connection that produced an answer is kept
        let answer = match answer_offer(&mut entry, self.local_media.as_ref(), offer).await {
            Ok(answer) => answer,
            Err(e) => {
                entry.close().await;
                return Err(e);
            }
        };
        self.stats.watch(&client_id, entry.connection.clone());
        self.stats.start(self.events_tx.clone());
        self.peers.insert(client_id.clone(), entry);

        match &self.signalling {
            Some(signalling) => {
                info!("[MASTER] Sending SDP answer to client: {client_id}");
                signalling.send_sdp_answer(&answer, Some(&client_id))?;
                info!("[MASTER] Generating ICE candidates for client: {client_id}");
            }
            None => warn!("[MASTER] No signalling connection, answer for {client_id} not sent"),
        }
        Ok(())
    }

    async fn handle_remote_candidate(
        &mut self,
        client_id: String,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), SessionError> {
        debug!("[MASTER] Received ICE candidate from client: {client_id}");
        match self.peers.get_mut(&client_id) {
            Some(entry) => entry.add_ice_candidate(candidate).await,
            None => {
                if !self.early_candidates.contains_key(&client_id)
                    && self.early_candidates.len() >= MAX_EARLY_CLIENTS
                {
                    warn!("[MASTER] Too many clients without an offer, dropping ICE candidate from: {client_id}");
                    return Ok(());
                }
                let early = self.early_candidates.entry(client_id).or_default();
                if early.len() >= MAX_EARLY_CANDIDATES {
                    warn!("[MASTER] Early ICE candidate buffer full, dropping candidate");
                    return Ok(());
                }
                debug!("[MASTER] Buffering ICE candidate from client without an offer");
                early.push(candidate);
                Ok(())
            }
        }
    }

    fn handle_peer_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::LocalCandidate { client_id, candidate } => {
                let Some(signalling) = &self.signalling else {
                    debug!("[MASTER] No signalling connection, dropping ICE candidate for {client_id}");
                    return;
                };
                debug!("[MASTER] Sending ICE candidate to client: {client_id}");
                if let Err(e) = signalling.send_ice_candidate(&candidate, Some(&client_id)) {
                    warn!("[MASTER] Failed to send ICE candidate to client {client_id}! ({e})");
                }
            }
            PeerMessage::RemoteTrack { client_id, track } => {
                let key = stream_key(&client_id, &track.stream_id());
                let in_view = self.remote_streams.accept(key, track.clone());
                if !in_view {
                    debug!("[MASTER] Remote view already taken, not showing track from {client_id}");
                }
                let event = SessionEvent::RemoteTrack {
                    client_id,
                    track,
                    in_view,
                };
                if self.events_tx.send(event).is_err() {
                    debug!("[MASTER] session event receiver dropped");
                }
            }
        }
    }

    async fn remove_peer(&mut self, client_id: &str) {
        if let Some(entry) = self.peers.remove(client_id) {
            self.stats.unwatch(client_id);
            self.remote_streams.remove_client(client_id);
            entry.close().await;
        }
    }

    /// Send bytes to a viewer over its data channel
    pub async fn send_data(&self, client_id: &str, data: Bytes) -> Result<(), SessionError> {
        let entry = self
            .peers
            .get(client_id)
            .ok_or_else(|| SessionError::UnknownPeer(client_id.to_string()))?;
        entry.send_data(&data).await
    }

    /// Tear down everything. Safe to call repeatedly, or without ever starting.
    pub async fn stop(&mut self) {
        info!("[MASTER] Stopping master connection");
        if let Some(mut signalling) = self.signalling.take() {
            signalling.close().await;
        }
        let peers: Vec<PeerEntry> = self.peers.drain().map(|(_, entry)| entry).collect();
        for entry in peers {
            entry.close().await;
        }
        self.early_candidates.clear();
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        self.remote_streams.clear();
        self.stats.stop();
        self.rtc_config = None;
        self.api = None;
        self.internal_rx.drain().for_each(drop);
    }

    /// Session events (remote tracks, data messages, statistics, connection states)
    pub fn events(&self) -> flume::Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn signalling_state(&self) -> Option<SignallingState> {
        self.signalling.as_ref().map(|signalling| signalling.state())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn peer_connection(&self, client_id: &str) -> Option<Arc<RTCPeerConnection>> {
        self.peers.get(client_id).map(|entry| entry.connection.clone())
    }

    pub fn peer_state(&self, client_id: &str) -> Option<RTCPeerConnectionState> {
        self.peers.get(client_id).map(|entry| entry.connection.connection_state())
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

#[cfg(test)]
mod tests {
    use super::*;

    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    use crate::SyntheticMedia;

    const HOST_CANDIDATE: &str = "candidate:1966762134 1 udp 2130706431 192.0.2.10 50000 typ host";

    /// A viewer-like peer producing offers for the master under test
    async fn remote_offer(api: &API) -> (PeerEntry, RTCSessionDescription) {
        let (events_tx, _) = flume::unbounded();
        let (internal_tx, _) = flume::unbounded();
        let entry = PeerConnectionBuilder::new(api, Role::Viewer, "MASTER_ID")
            .build(&events_tx, &internal_tx)
            .await
            .unwrap();
        entry.ensure_receiving(None).await.unwrap();
        let offer = entry.create_offer().await.unwrap();
        (entry, offer)
    }

    fn offer_from(client_id: &str, offer: RTCSessionDescription) -> SignalEvent {
        SignallingEvent::SdpOffer(Signal {
            payload: offer,
            remote_id: Some(client_id.to_string()),
        })
    }

    fn started(options: SessionOptions) -> MasterSession {
        let mut master = MasterSession::new(options);
        master.prepare(&RtcConfiguration::default()).unwrap();
        master
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut master = MasterSession::new(SessionOptions::default());
        master.stop().await;
        master.stop().await;
        assert!(!master.is_started());
        assert_eq!(master.peer_count(), 0);
        assert!(master.signalling_state().is_none());
        assert!(master.local_media().is_none());
        assert!(master.remote_view().is_empty());
        assert!(!master.is_stats_running());
    }

    #[tokio::test]
    async fn step_before_start_fails() {
        let mut master = MasterSession::new(SessionOptions::default());
        assert!(matches!(master.step().await, Err(SessionError::NotStarted)));
    }

    #[tokio::test]
    async fn offers_from_distinct_clients_get_distinct_entries() {
        let options = SessionOptions::default().set_media(Arc::new(SyntheticMedia::default()));
        let mut master = started(options);
        assert!(master.local_media().is_some());
        assert!(!master.is_stats_running());

        let api = build_api(&SessionOptions::default()).unwrap();
        let (viewer_a, offer_a) = remote_offer(&api).await;
        let (viewer_b, offer_b) = remote_offer(&api).await;
        master.handle_signal(offer_from("A", offer_a)).await.unwrap();
        assert!(master.is_stats_running());
        master.handle_signal(offer_from("B", offer_b)).await.unwrap();

        assert_eq!(master.peer_count(), 2);
        let (a, b) = (master.peer_connection("A").unwrap(), master.peer_connection("B").unwrap());
        assert!(!Arc::ptr_eq(&a, &b));
        let answer = a.local_description().await.unwrap();
        assert!(answer.sdp.contains("m=application"));

        master.stop().await;
        assert_eq!(master.peer_count(), 0);
        assert!(!master.is_stats_running());
        assert!(master.local_media().is_none());
        assert_eq!(a.connection_state(), RTCPeerConnectionState::Closed);
        viewer_a.close().await;
        viewer_b.close().await;
    }

    #[tokio::test]
    async fn repeated_offer_replaces_entry() {
        let mut master = started(SessionOptions::default());
        let api = build_api(&SessionOptions::default()).unwrap();
        let (first_viewer, first) = remote_offer(&api).await;
        let (second_viewer, second) = remote_offer(&api).await;

        master.handle_signal(offer_from("A", first)).await.unwrap();
        let original = master.peer_connection("A").unwrap();
        master.handle_signal(offer_from("A", second)).await.unwrap();

        assert_eq!(master.peer_count(), 1);
        let replacement = master.peer_connection("A").unwrap();
        assert!(!Arc::ptr_eq(&original, &replacement));
        assert_eq!(original.connection_state(), RTCPeerConnectionState::Closed);

        master.stop().await;
        first_viewer.close().await;
        second_viewer.close().await;
    }

    #[tokio::test]
    async fn repeated_offer_can_be_rejected() {
        let options = SessionOptions::default().set_duplicate_offer_policy(DuplicateOfferPolicy::Reject);
        let mut master = started(options);
        let api = build_api(&SessionOptions::default()).unwrap();
        let (first_viewer, first) = remote_offer(&api).await;
        let (second_viewer, second) = remote_offer(&api).await;

        master.handle_signal(offer_from("A", first)).await.unwrap();
        let original = master.peer_connection("A").unwrap();
        master.handle_signal(offer_from("A", second)).await.unwrap();

        assert_eq!(master.peer_count(), 1);
        assert!(Arc::ptr_eq(&original, &master.peer_connection("A").unwrap()));

        master.stop().await;
        first_viewer.close().await;
        second_viewer.close().await;
    }

    #[tokio::test]
    async fn candidates_before_offer_are_buffered() {
        let mut master = started(SessionOptions::default());
        master.handle_signal(candidate_from("C", HOST_CANDIDATE)).await.unwrap();
        assert_eq!(master.peer_count(), 0);
        assert_eq!(master.early_candidates["C"].len(), 1);

        let api = build_api(&SessionOptions::default()).unwrap();
        let (viewer, offer) = remote_offer(&api).await;
        master.handle_signal(offer_from("C", offer)).await.unwrap();
        assert!(master.early_candidates.is_empty());
        assert_eq!(master.peers["C"].pending_candidates(), 0);

        master.stop().await;
        viewer.close().await;
    }

    fn candidate_from(client_id: &str, candidate: &str) -> SignalEvent {
        SignallingEvent::IceCandidate(Signal {
            payload: RTCIceCandidateInit {
                candidate: candidate.to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                ..Default::default()
            },
            remote_id: Some(client_id.to_string()),
        })
    }

    #[tokio::test]
    async fn bad_early_candidate_does_not_block_answer() {
        let mut master = started(SessionOptions::default());
        master.handle_signal(candidate_from("C", "candidate:garbage")).await.unwrap();
        master.handle_signal(candidate_from("C", HOST_CANDIDATE)).await.unwrap();
        assert_eq!(master.early_candidates["C"].len(), 2);

        let api = build_api(&SessionOptions::default()).unwrap();
        let (viewer, offer) = remote_offer(&api).await;
        master.handle_signal(offer_from("C", offer)).await.unwrap();

        assert_eq!(master.peer_count(), 1);
        assert_eq!(master.peers["C"].pending_candidates(), 0);
        let answer = master.peer_connection("C").unwrap().local_description().await;
        assert!(answer.is_some_and(|answer| answer.sdp.contains("a=fingerprint")));

        master.stop().await;
        viewer.close().await;
    }

    #[tokio::test]
    async fn failed_offer_leaves_no_entry() {
        let options = SessionOptions::default().set_duplicate_offer_policy(DuplicateOfferPolicy::Reject);
        let mut master = started(options);
        let mut bogus = RTCSessionDescription::default();
        bogus.sdp_type = RTCSdpType::Offer;
        bogus.sdp = "v=0\r\nbogus".to_string();

        assert!(master.handle_signal(offer_from("D", bogus)).await.is_err());
        assert_eq!(master.peer_count(), 0);
        assert!(!master.is_stats_running());

        // a later valid offer from the same client is still answered
        let api = build_api(&SessionOptions::default()).unwrap();
        let (viewer, offer) = remote_offer(&api).await;
        master.handle_signal(offer_from("D", offer)).await.unwrap();
        assert_eq!(master.peer_count(), 1);
        assert!(master.is_stats_running());
        let connection = master.peer_connection("D").unwrap();
        assert!(connection.local_description().await.is_some());

        master.stop().await;
        viewer.close().await;
    }

    #[tokio::test]
    async fn early_candidate_buffer_is_bounded() {
        let mut master = started(SessionOptions::default());
        for _ in 0..MAX_EARLY_CANDIDATES + 10 {
            master.handle_signal(candidate_from("E", HOST_CANDIDATE)).await.unwrap();
        }
        assert_eq!(master.early_candidates["E"].len(), MAX_EARLY_CANDIDATES);

        for i in 1..MAX_EARLY_CLIENTS {
            master
                .handle_signal(candidate_from(&format!("client-{i}"), HOST_CANDIDATE))
                .await
                .unwrap();
        }
        assert_eq!(master.early_candidates.len(), MAX_EARLY_CLIENTS);
        master.handle_signal(candidate_from("late", HOST_CANDIDATE)).await.unwrap();
        assert!(!master.early_candidates.contains_key("late"));
        // known clients keep buffering
        assert_eq!(master.early_candidates["client-1"].len(), 1);
        master.handle_signal(candidate_from("client-1", HOST_CANDIDATE)).await.unwrap();
        assert_eq!(master.early_candidates["client-1"].len(), 2);

        master.stop().await;
        assert!(master.early_candidates.is_empty());
    }

    #[tokio::test]
    async fn offer_without_sender_is_ignored() {
        let mut master = started(SessionOptions::default());
        let api = build_api(&SessionOptions::default()).unwrap();
        let (viewer, offer) = remote_offer(&api).await;
        let anonymous = SignallingEvent::SdpOffer(Signal {
            payload: offer,
            remote_id: None,
        });
        master.handle_signal(anonymous).await.unwrap();
        assert_eq!(master.peer_count(), 0);
        assert!(matches!(
            master.send_data("nobody", Bytes::from_static(b"hi")).await,
            Err(SessionError::UnknownPeer(_))
        ));
        master.stop().await;
        viewer.close().await;
    }
}
