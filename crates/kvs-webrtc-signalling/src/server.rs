//! Config endpoint server

use std::{collections::BTreeMap, net::SocketAddr, path::Path, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use log::{error, info};
use rand::Rng;
use serde::Deserialize;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::{
    control_plane::{ControlPlane, ControlPlaneError},
    signer::{RequestSigner, SignerError},
    types::{ChannelConfig, IceServer, IceTransportPolicy, Role, RtcConfiguration, MASTER_CLIENT_ID},
};

const CLIENT_ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const CLIENT_ID_LEN: usize = 11;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("Signalling channel has no {0} endpoint!")]
    MissingEndpoint(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        error!("config request failed ({self})");
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// Generate a viewer client ID: base-36, uppercased.
///
/// Only used to correlate signalling messages, collisions are acceptable.
pub fn random_client_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CLIENT_ID_LEN)
        .map(|_| CLIENT_ID_ALPHABET[rng.gen_range(0..CLIENT_ID_ALPHABET.len())] as char)
        .collect()
}

/// STUN server of the signalling service, always offered ahead of any TURN server
pub fn stun_url(region: &str) -> String {
    format!("stun:stun.kinesisvideo.{region}.amazonaws.com:443")
}

/// Composes the control plane and the request signer into [`ChannelConfig`] payloads
#[derive(Debug)]
pub struct ConfigService<P, S> {
    control_plane: P,
    signer: S,
    region: String,
    channel_name: String,
}

impl<P: ControlPlane, S: RequestSigner> ConfigService<P, S> {
    pub fn new(control_plane: P, signer: S, region: impl Into<String>, channel_name: impl Into<String>) -> Self {
        Self {
            control_plane,
            signer,
            region: region.into(),
            channel_name: channel_name.into(),
        }
    }

    /// Resolve the channel and produce a signed configuration for a peer of the given role.
    ///
    /// Each call performs its own control plane round trips, failures are not retried.
    pub async fn get_config(&self, role: Role) -> Result<ChannelConfig, ServerError> {
        let channel_arn = self
            .control_plane
            .describe_signaling_channel(&self.channel_name)
            .await?;
        info!("[{role}] Channel ARN: {channel_arn}");

        let endpoints = self
            .control_plane
            .get_signaling_channel_endpoints(&channel_arn, role)
            .await?;
        info!("[{role}] Endpoints: {endpoints:?}");
        let wss = endpoints.wss.ok_or(ServerError::MissingEndpoint("WSS"))?;
        let https = endpoints.https.ok_or(ServerError::MissingEndpoint("HTTPS"))?;

        let mut ice_servers = vec![IceServer::stun(stun_url(&self.region))];
        ice_servers.extend(self.control_plane.get_ice_server_config(&channel_arn, &https).await?);
        info!("[{role}] ICE servers: {}", ice_servers.len());

        let client_id = match role {
            Role::Master => MASTER_CLIENT_ID.to_string(),
            Role::Viewer => random_client_id(),
        };
        let query = BTreeMap::from([
            ("X-Amz-ChannelARN".to_string(), channel_arn.clone()),
            ("X-Amz-ClientId".to_string(), client_id.clone()),
        ]);
        let url = self.signer.sign_url(&wss, &query, Utc::now())?;

        Ok(ChannelConfig {
            channel_arn,
            wss,
            configuration: RtcConfiguration {
                ice_servers,
                ice_transport_policy: IceTransportPolicy::All,
            },
            url,
            client_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GetConfigParams {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

async fn get_config<P, S>(
    State(service): State<Arc<ConfigService<P, S>>>,
    Query(params): Query<GetConfigParams>,
) -> Result<Json<ChannelConfig>, ServerError>
where
    P: ControlPlane + Sync + 'static,
    S: RequestSigner + Send + Sync + 'static,
{
    let role = Role::from_client_id_hint(params.client_id.as_deref());
    let config = service.get_config(role).await?;
    Ok(Json(config))
}

/// Build the HTTP router: `GET /getConfig` plus the static page directory at `/`
pub fn router<P, S>(service: Arc<ConfigService<P, S>>, static_dir: impl AsRef<Path>) -> Router
where
    P: ControlPlane + Sync + 'static,
    S: RequestSigner + Send + Sync + 'static,
{
    Router::new()
        .route("/getConfig", get(get_config::<P, S>))
        .with_state(service)
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
}

/// Start the config endpoint server
pub async fn serve<P, S>(
    service: Arc<ConfigService<P, S>>,
    addr: SocketAddr,
    static_dir: impl AsRef<Path>,
) -> Result<(), ServerError>
where
    P: ControlPlane + Sync + 'static,
    S: RequestSigner + Send + Sync + 'static,
{
    let app = router(service, static_dir);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("app running on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_uppercase_base36() {
        let a = random_client_id();
        let b = random_client_id();
        assert_eq!(a.len(), CLIENT_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(a, b);
        assert_ne!(a, MASTER_CLIENT_ID);
    }

    #[test]
    fn stun_url_is_regional() {
        assert_eq!(stun_url("ap-south-1"), "stun:stun.kinesisvideo.ap-south-1.amazonaws.com:443");
    }
}
