//! Signalling channel control plane

use aws_sdk_kinesisvideo::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    types::{ChannelProtocol, ChannelRole, SingleMasterChannelEndpointConfiguration},
};
use log::debug;

use crate::{signer::SigningCredentials, types::IceServer, Role};

#[derive(thiserror::Error, Debug)]
pub enum ControlPlaneError {
    #[error("Signalling channel not found! ({0})")]
    ChannelNotFound(String),
    #[error("Control plane request failed! ({0})")]
    Request(String),
    #[error("Invalid response from control plane! ({0})")]
    InvalidResponse(&'static str),
}

/// Transport endpoints of a signalling channel, by protocol
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoints {
    pub wss: Option<String>,
    pub https: Option<String>,
}

/// Cloud control plane of the signalling service
///
/// Every call is a full network round trip, nothing is cached.
#[trait_variant::make(ControlPlane: Send)]
pub trait LocalControlPlane {
    /// Resolve the channel ARN from its human readable name
    async fn describe_signaling_channel(&self, channel_name: &str) -> Result<String, ControlPlaneError>;

    /// Resolve the role-scoped WSS and HTTPS endpoints of a channel
    async fn get_signaling_channel_endpoints(
        &self,
        channel_arn: &str,
        role: Role,
    ) -> Result<ChannelEndpoints, ControlPlaneError>;

    /// Issue a short-lived set of TURN servers scoped to the channel
    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Vec<IceServer>, ControlPlaneError>;
}

/// [`ControlPlane`] backed by the Kinesis Video Streams SDK
#[derive(Debug, Clone)]
pub struct KinesisVideoControlPlane {
    region: Region,
    credentials: Credentials,
    client: aws_sdk_kinesisvideo::Client,
}

impl KinesisVideoControlPlane {
    pub fn new(region: &str, credentials: &SigningCredentials) -> Self {
        let region = Region::new(region.to_string());
        let credentials = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            credentials.session_token.clone(),
            None,
            "kvs-webrtc-signalling",
        );
        let config = aws_sdk_kinesisvideo::Config::builder()
            .region(region.clone())
            .credentials_provider(credentials.clone())
            .build();
        Self {
            region,
            credentials,
            client: aws_sdk_kinesisvideo::Client::from_conf(config),
        }
    }
}

impl ControlPlane for KinesisVideoControlPlane {
    async fn describe_signaling_channel(&self, channel_name: &str) -> Result<String, ControlPlaneError> {
        let response = self
            .client
            .describe_signaling_channel()
            .channel_name(channel_name)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service_error) if service_error.is_resource_not_found_exception() => {
                    ControlPlaneError::ChannelNotFound(channel_name.to_string())
                }
                _ => ControlPlaneError::Request(DisplayErrorContext(&e).to_string()),
            })?;
        response
            .channel_info()
            .and_then(|info| info.channel_arn())
            .map(str::to_string)
            .ok_or(ControlPlaneError::InvalidResponse("missing channel ARN"))
    }

    async fn get_signaling_channel_endpoints(
        &self,
        channel_arn: &str,
        role: Role,
    ) -> Result<ChannelEndpoints, ControlPlaneError> {
        let channel_role = match role {
            Role::Master => ChannelRole::Master,
            Role::Viewer => ChannelRole::Viewer,
        };
        let endpoint_config = SingleMasterChannelEndpointConfiguration::builder()
            .protocols(ChannelProtocol::Wss)
            .protocols(ChannelProtocol::Https)
            .role(channel_role)
            .build();
        let response = self
            .client
            .get_signaling_channel_endpoint()
            .channel_arn(channel_arn)
            .single_master_channel_endpoint_configuration(endpoint_config)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request(DisplayErrorContext(&e).to_string()))?;
        let mut endpoints = ChannelEndpoints::default();
        for item in response.resource_endpoint_list() {
            let endpoint = item.resource_endpoint().map(str::to_string);
            match item.protocol() {
                Some(ChannelProtocol::Wss) => endpoints.wss = endpoint,
                Some(ChannelProtocol::Https) => endpoints.https = endpoint,
                other => debug!("ignoring endpoint for protocol {other:?}"),
            }
        }
        Ok(endpoints)
    }

    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Vec<IceServer>, ControlPlaneError> {
        // the signalling channels API is served from the channel's own HTTPS endpoint
        let config = aws_sdk_kinesisvideosignaling::Config::builder()
            .region(self.region.clone())
            .credentials_provider(self.credentials.clone())
            .endpoint_url(https_endpoint)
            .build();
        let client = aws_sdk_kinesisvideosignaling::Client::from_conf(config);
        let response = client
            .get_ice_server_config()
            .channel_arn(channel_arn)
            .send()
            .await
            .map_err(|e| {
                ControlPlaneError::Request(
                    aws_sdk_kinesisvideosignaling::error::DisplayErrorContext(&e).to_string(),
                )
            })?;
        let ice_servers = response
            .ice_server_list()
            .iter()
            .map(|server| IceServer {
                urls: server.uris().to_vec(),
                username: server.username().map(str::to_string),
                credential: server.password().map(str::to_string),
            })
            .collect();
        Ok(ice_servers)
    }
}
