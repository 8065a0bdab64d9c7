//! Signalling service wire frames
//!
//! Frames are JSON text messages. Payloads (session descriptions, ICE candidates) are
//! JSON documents carried base64-encoded inside the frame.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::client::{ClientError, Signal, SignallingEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    SdpOffer,
    SdpAnswer,
    IceCandidate,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::SdpOffer => "SDP_OFFER",
            Action::SdpAnswer => "SDP_ANSWER",
            Action::IceCandidate => "ICE_CANDIDATE",
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundFrame<'a> {
    action: &'a str,
    message_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient_client_id: Option<&'a str>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    message_type: String,
    #[serde(default)]
    message_payload: String,
    #[serde(default)]
    sender_client_id: Option<String>,
    #[serde(default)]
    status_response: Option<StatusResponse>,
}

/// Error report sent by the signalling service in reply to a rejected message
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub correlation_id: Option<String>,
    pub error_type: Option<String>,
    pub status_code: Option<String>,
    pub description: Option<String>,
}

pub(crate) fn encode_frame<T: Serialize>(
    action: Action,
    payload: &T,
    recipient: Option<&str>,
) -> Result<String, ClientError> {
    let payload = serde_json::to_vec(payload)?;
    let frame = OutboundFrame {
        action: action.as_str(),
        message_payload: STANDARD.encode(payload),
        recipient_client_id: recipient,
    };
    Ok(serde_json::to_string(&frame)?)
}

fn decode_payload<T: DeserializeOwned>(payload: &str) -> Result<T, ClientError> {
    let bytes = STANDARD.decode(payload)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Decode an inbound frame into a signalling event.
///
/// Returns `None` for unknown message types.
pub(crate) fn decode_frame<D, C>(text: &str) -> Result<Option<SignallingEvent<D, C>>, ClientError>
where
    D: DeserializeOwned,
    C: DeserializeOwned,
{
    let frame: InboundFrame = serde_json::from_str(text)?;
    let remote_id = frame.sender_client_id.filter(|id| !id.is_empty());
    let event = match frame.message_type.as_str() {
        "SDP_OFFER" => SignallingEvent::SdpOffer(Signal {
            payload: decode_payload(&frame.message_payload)?,
            remote_id,
        }),
        "SDP_ANSWER" => SignallingEvent::SdpAnswer(Signal {
            payload: decode_payload(&frame.message_payload)?,
            remote_id,
        }),
        "ICE_CANDIDATE" => SignallingEvent::IceCandidate(Signal {
            payload: decode_payload(&frame.message_payload)?,
            remote_id,
        }),
        "STATUS_RESPONSE" => {
            let status = frame.status_response.unwrap_or_default();
            warn!("signalling service reported an error: {status:?}");
            SignallingEvent::Status(status)
        }
        other => {
            debug!("ignoring signalling message of type {other}");
            return Ok(None);
        }
    };
    Ok(Some(event))
}
