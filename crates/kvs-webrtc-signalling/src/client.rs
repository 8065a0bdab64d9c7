//! Signalling channel client
//!
//! Connects to a presigned signalling websocket URL and exchanges session descriptions and
//! ICE candidates with remote peers. Description and candidate types are generic so the
//! client stays independent of any particular WebRTC implementation.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use futures_util::{pin_mut, select, FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    message::{decode_frame, encode_frame, Action},
    types::{ChannelConfig, Role},
};

pub use crate::message::StatusResponse;

/// Time given to the connection task to finish the close handshake
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Signalling client error
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
    #[error("Config request failed with status {0}!")]
    ConfigStatus(reqwest::StatusCode),
    #[error("Signalling connection is not open!")]
    NotOpen,
    #[error("Signalling client was already opened!")]
    AlreadyOpened,
    #[error("Master messages must address a recipient client!")]
    MissingRecipient,
    #[error("Viewer messages cannot address a recipient client!")]
    UnexpectedRecipient,
}

/// Signalling client result
pub type ClientResult<T> = Result<T, ClientError>;

/// Connection state of a signalling client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignallingState {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// A payload received from (or addressed to) a remote client
#[derive(Debug, Clone, PartialEq)]
pub struct Signal<T> {
    pub payload: T,
    /// Sender client ID. Masters receive one with every message, viewers usually do not.
    pub remote_id: Option<String>,
}

/// Events emitted by the signalling client
#[derive(Debug, Clone)]
pub enum SignallingEvent<D, C> {
    Open,
    SdpOffer(Signal<D>),
    SdpAnswer(Signal<D>),
    IceCandidate(Signal<C>),
    /// The service rejected a message sent earlier
    Status(StatusResponse),
    Close,
    Error(String),
}

/// Fetch the channel configuration for `role` from a config server
pub async fn fetch_config(server_url: &str, role: Role) -> ClientResult<ChannelConfig> {
    let url = format!("{}/getConfig?clientId={}", server_url.trim_end_matches('/'), role);
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        return Err(ClientError::ConfigStatus(response.status()));
    }
    Ok(response.json().await?)
}

/// Signalling channel client
///
/// `D` is the session description type and `C` the ICE candidate type exchanged with peers.
pub struct SignallingClient<D, C> {
    url: String,
    role: Role,
    state_tx: Arc<watch::Sender<SignallingState>>,
    state_rx: watch::Receiver<SignallingState>,
    outbound_tx: Option<flume::Sender<String>>,
    outbound_rx: Option<flume::Receiver<String>>,
    events_tx: Option<flume::Sender<SignallingEvent<D, C>>>,
    events_rx: flume::Receiver<SignallingEvent<D, C>>,
    task: Option<JoinHandle<()>>,
    _payloads: PhantomData<fn() -> (D, C)>,
}

impl<D, C> SignallingClient<D, C> {
    /// Create a new client for a presigned signalling URL
    pub fn new(url: impl Into<String>, role: Role) -> Self {
        let (state_tx, state_rx) = watch::channel(SignallingState::Idle);
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            url: url.into(),
            role,
            state_tx: Arc::new(state_tx),
            state_rx,
            outbound_tx: Some(outbound_tx),
            outbound_rx: Some(outbound_rx),
            events_tx: Some(events_tx),
            events_rx,
            task: None,
            _payloads: PhantomData,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SignallingState {
        *self.state_rx.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<SignallingState> {
        self.state_rx.clone()
    }

    /// Receive the next signalling event.
    ///
    /// Returns `None` once the client is closed and all events were drained.
    pub async fn next_event(&self) -> Option<SignallingEvent<D, C>> {
        self.events_rx.recv_async().await.ok()
    }

    fn check_recipient(&self, recipient: Option<&str>) -> ClientResult<()> {
        match (self.role, recipient) {
            (Role::Master, None) => Err(ClientError::MissingRecipient),
            (Role::Viewer, Some(_)) => Err(ClientError::UnexpectedRecipient),
            _ => Ok(()),
        }
    }

    fn send<T: Serialize>(&self, action: Action, payload: &T, recipient: Option<&str>) -> ClientResult<()> {
        self.check_recipient(recipient)?;
        if self.state() != SignallingState::Open {
            return Err(ClientError::NotOpen);
        }
        let frame = encode_frame(action, payload, recipient)?;
        let outbound_tx = self.outbound_tx.as_ref().ok_or(ClientError::NotOpen)?;
        outbound_tx.send(frame).map_err(|_| ClientError::NotOpen)
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        self.outbound_tx.take();
        self.outbound_rx.take();
        self.events_tx.take();
        if let Some(mut task) = self.task.take() {
            if self.state() == SignallingState::Connecting {
                task.abort();
            } else if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("[{}] signalling connection did not close in time, aborting", self.role);
                task.abort();
            }
        }
        self.state_tx.send_replace(SignallingState::Closed);
    }
}

impl<D, C> SignallingClient<D, C>
where
    D: Serialize + DeserializeOwned + Send + 'static,
    C: Serialize + DeserializeOwned + Send + 'static,
{
    /// Start connecting to the signalling channel.
    ///
    /// Progress is reported through [`SignallingEvent::Open`] (or `Error` followed by `Close`).
    pub fn open(&mut self) -> ClientResult<()> {
        if self.state() != SignallingState::Idle {
            return Err(ClientError::AlreadyOpened);
        }
        let (Some(outbound_rx), Some(events_tx)) = (self.outbound_rx.take(), self.events_tx.take()) else {
            return Err(ClientError::AlreadyOpened);
        };
        self.state_tx.send_replace(SignallingState::Connecting);
        self.task = Some(tokio::spawn(connection_task(
            self.url.clone(),
            self.role,
            self.state_tx.clone(),
            outbound_rx,
            events_tx,
        )));
        Ok(())
    }

    pub fn send_sdp_offer(&self, offer: &D, recipient: Option<&str>) -> ClientResult<()> {
        self.send(Action::SdpOffer, offer, recipient)
    }

    pub fn send_sdp_answer(&self, answer: &D, recipient: Option<&str>) -> ClientResult<()> {
        self.send(Action::SdpAnswer, answer, recipient)
    }

    pub fn send_ice_candidate(&self, candidate: &C, recipient: Option<&str>) -> ClientResult<()> {
        self.send(Action::IceCandidate, candidate, recipient)
    }
}

async fn connection_task<D, C>(
    url: String,
    role: Role,
    state_tx: Arc<watch::Sender<SignallingState>>,
    outbound_rx: flume::Receiver<String>,
    events_tx: flume::Sender<SignallingEvent<D, C>>,
) where
    D: DeserializeOwned,
    C: DeserializeOwned,
{
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            error!("[{role}] Signaling client error! ({e})");
            state_tx.send_replace(SignallingState::Closed);
            let _ = events_tx.send(SignallingEvent::Error(e.to_string()));
            let _ = events_tx.send(SignallingEvent::Close);
            return;
        }
    };
    info!("[{role}] Connected to signaling service");
    state_tx.send_replace(SignallingState::Open);
    let _ = events_tx.send(SignallingEvent::Open);

    let (mut sink, mut stream) = ws.split();
    loop {
        let inbound = stream.next().fuse();
        let outbound = outbound_rx.recv_async().fuse();
        pin_mut!(inbound, outbound);
        select! {
            message = inbound => match message {
                Some(Ok(Message::Text(text))) => match decode_frame::<D, C>(&text) {
                    Ok(Some(event)) => {
                        if events_tx.send(event).is_err() {
                            debug!("[{role}] signalling event receiver dropped");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("[{role}] Failed to parse signalling message! ({e})"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{role}] close frame received ({frame:?})");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("[{role}] Signaling client error! ({e})");
                    let _ = events_tx.send(SignallingEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
            frame = outbound => match frame {
                Ok(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("[{role}] Signaling client error! ({e})");
                        let _ = events_tx.send(SignallingEvent::Error(e.to_string()));
                        break;
                    }
                }
                Err(_) => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!("[{role}] failed to send close frame ({e})");
                    }
                    break;
                }
            },
        }
    }
    info!("[{role}] Disconnected from signaling channel");
    state_tx.send_replace(SignallingState::Closed);
    let _ = events_tx.send(SignallingEvent::Close);
}
