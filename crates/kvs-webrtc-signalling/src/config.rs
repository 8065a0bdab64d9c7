use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::{signer::SigningCredentials, DEFAULT_SERVER_ADDR};

pub const DEFAULT_STATIC_DIR: &str = "public";

/// Deployment-fixed configuration of the config endpoint server.
///
/// The signing credentials should come from a secret store in production,
/// the environment is the fallback for every option.
#[derive(Parser, Debug, Clone)]
#[command(name = "kvs-webrtc-signalling", version, about = "Config endpoint for Kinesis Video WebRTC peers")]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    #[arg(long, env = "KVS_BIND_ADDR", default_value = DEFAULT_SERVER_ADDR)]
    pub bind: SocketAddr,

    /// Region of the signalling channel
    #[arg(long, env = "AWS_REGION")]
    pub region: String,

    /// Human readable name of the signalling channel
    #[arg(long, env = "KVS_CHANNEL_NAME")]
    pub channel_name: String,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: String,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: String,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub session_token: Option<String>,

    /// Directory served at `/`
    #[arg(long, env = "KVS_STATIC_DIR", default_value = DEFAULT_STATIC_DIR)]
    pub static_dir: PathBuf,
}

impl ServerConfig {
    pub fn credentials(&self) -> SigningCredentials {
        SigningCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone(),
        }
    }
}
