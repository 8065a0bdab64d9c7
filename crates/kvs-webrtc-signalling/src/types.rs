use std::fmt;

use serde::{Deserialize, Serialize};

/// Client ID assigned to every master peer
pub const MASTER_CLIENT_ID: &str = "MASTER_ID";

/// Role a peer plays on a signalling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Offers media, answers every viewer
    #[serde(rename = "MASTER")]
    Master,
    /// Requests media from the master
    #[serde(rename = "VIEWER")]
    Viewer,
}

impl Role {
    /// Interpret the `clientId` hint of a config request.
    ///
    /// Only the literal `MASTER` selects the master role, anything else (or nothing) is a viewer.
    pub fn from_client_id_hint(hint: Option<&str>) -> Self {
        match hint {
            Some("MASTER") => Role::Master,
            _ => Role::Viewer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "MASTER",
            Role::Viewer => "VIEWER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IceServer describes a single STUN or TURN server handed to the peers.
#[derive(Default, Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Credential-less STUN entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// IceTransportPolicy defines the ICE candidate policy surface the
/// permitted candidates. Only these candidates are used for connectivity checks.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, Hash)]
pub enum IceTransportPolicy {
    /// Any type of candidate is used.
    #[default]
    #[serde(rename = "all")]
    All,
    /// Only media relay candidates (TURN) are used.
    #[serde(rename = "relay")]
    Relay,
}

/// Peer connection configuration, shaped like the browser `RTCConfiguration` dictionary.
#[derive(Default, Debug, Clone, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

/// Payload returned by `GET /getConfig`.
///
/// Everything a peer needs to join the channel: the channel ARN, the raw WSS endpoint,
/// the ICE configuration, the presigned signalling URL and the client ID assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(rename = "channelARN")]
    pub channel_arn: String,
    pub wss: String,
    pub configuration: RtcConfiguration,
    pub url: String,
    pub client_id: String,
}
