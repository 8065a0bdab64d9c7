use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use kvs_webrtc_signalling::{
    client::{fetch_config, ClientError},
    control_plane::{ChannelEndpoints, ControlPlane, ControlPlaneError},
    server::{router, ConfigService},
    signer::{SigV4RequestSigner, SigningCredentials},
    ChannelConfig, IceServer, Role, MASTER_CLIENT_ID,
};
use tower::ServiceExt;

const CHANNEL_NAME: &str = "test-channel";
const CHANNEL_ARN: &str = "arn:aws:kinesisvideo:us-west-2:123456789012:channel/test-channel/1234567890";
const REGION: &str = "us-west-2";

#[derive(Default)]
struct FakeControlPlane {
    fail_describe: bool,
    fail_ice: bool,
    /// Replaces the single TURN server normally returned
    ice_servers: Option<Vec<IceServer>>,
    missing_wss: bool,
    missing_https: bool,
}

impl ControlPlane for FakeControlPlane {
    async fn describe_signaling_channel(&self, channel_name: &str) -> Result<String, ControlPlaneError> {
        if self.fail_describe {
            return Err(ControlPlaneError::ChannelNotFound(channel_name.to_string()));
        }
        assert_eq!(channel_name, CHANNEL_NAME);
        Ok(CHANNEL_ARN.to_string())
    }

    async fn get_signaling_channel_endpoints(
        &self,
        channel_arn: &str,
        role: Role,
    ) -> Result<ChannelEndpoints, ControlPlaneError> {
        assert_eq!(channel_arn, CHANNEL_ARN);
        let prefix = match role {
            Role::Master => "m",
            Role::Viewer => "v",
        };
        Ok(ChannelEndpoints {
            wss: (!self.missing_wss).then(|| format!("wss://{prefix}-1234.kinesisvideo.{REGION}.amazonaws.com")),
            https: (!self.missing_https).then(|| format!("https://{prefix}-1234.kinesisvideo.{REGION}.amazonaws.com")),
        })
    }

    async fn get_ice_server_config(
        &self,
        channel_arn: &str,
        https_endpoint: &str,
    ) -> Result<Vec<IceServer>, ControlPlaneError> {
        assert_eq!(channel_arn, CHANNEL_ARN);
        assert!(https_endpoint.starts_with("https://"));
        if self.fail_ice {
            return Err(ControlPlaneError::Request("throttled".to_string()));
        }
        if let Some(ice_servers) = &self.ice_servers {
            return Ok(ice_servers.clone());
        }
        Ok(vec![IceServer {
            urls: vec![format!("turn:1-2-3-4.kinesisvideo.{REGION}.amazonaws.com:443?transport=udp")],
            username: Some("user".to_string()),
            credential: Some("password".to_string()),
        }])
    }
}

fn service(control_plane: FakeControlPlane) -> Arc<ConfigService<FakeControlPlane, SigV4RequestSigner>> {
    let credentials = SigningCredentials {
        access_key_id: "AKIDEXAMPLE".to_string(),
        secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        session_token: None,
    };
    let signer = SigV4RequestSigner::new(REGION, credentials);
    Arc::new(ConfigService::new(control_plane, signer, REGION, CHANNEL_NAME))
}

async fn request_config(
    service: Arc<ConfigService<FakeControlPlane, SigV4RequestSigner>>,
    uri: &str,
) -> Result<(StatusCode, serde_json::Value)> {
    let response = router(service, "public")
        .oneshot(Request::builder().uri(uri).body(Body::empty())?)
        .await?;
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&body)?))
}

#[tokio::test]
async fn master_config() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let (status, body) = request_config(service(FakeControlPlane::default()), "/getConfig?clientId=MASTER").await?;
    assert_eq!(status, StatusCode::OK);
    let config: ChannelConfig = serde_json::from_value(body.clone())?;
    assert_eq!(config.client_id, MASTER_CLIENT_ID);
    assert_eq!(config.channel_arn, CHANNEL_ARN);
    assert!(config.wss.starts_with("wss://m-1234"));
    assert_eq!(body["configuration"]["iceTransportPolicy"], "all");
    assert!(body.get("channelARN").is_some());

    let ice_servers = &config.configuration.ice_servers;
    assert_eq!(ice_servers.len(), 2);
    assert_eq!(ice_servers[0].urls, vec![format!("stun:stun.kinesisvideo.{REGION}.amazonaws.com:443")]);
    assert!(ice_servers[0].username.is_none());
    assert_eq!(ice_servers[1].username.as_deref(), Some("user"));

    let url = url::Url::parse(&config.url)?;
    assert_eq!(url.scheme(), "wss");
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(params["X-Amz-ChannelARN"], CHANNEL_ARN);
    assert_eq!(params["X-Amz-ClientId"], MASTER_CLIENT_ID);
    assert_eq!(params["X-Amz-Algorithm"], "AWS4-HMAC-SHA256");
    assert_eq!(params["X-Amz-SignedHeaders"], "host");
    assert_eq!(params["X-Amz-Signature"].len(), 64);
    assert!(params["X-Amz-Credential"].ends_with(&format!("/{REGION}/kinesisvideo/aws4_request")));
    Ok(())
}

#[tokio::test]
async fn viewer_configs_get_fresh_client_ids() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let service = service(FakeControlPlane::default());
    let mut ids = Vec::new();
    for uri in ["/getConfig?clientId=VIEWER", "/getConfig", "/getConfig?clientId=master"] {
        let (status, body) = request_config(service.clone(), uri).await?;
        assert_eq!(status, StatusCode::OK);
        let config: ChannelConfig = serde_json::from_value(body)?;
        assert!(config.wss.starts_with("wss://v-1234"));
        assert_ne!(config.client_id, MASTER_CLIENT_ID);
        assert!(config
            .client_id
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert!(config.url.contains(&format!("X-Amz-ClientId={}", config.client_id)));
        ids.push(config.client_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);
    Ok(())
}

#[tokio::test]
async fn control_plane_failure_is_a_server_error() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let control_plane = FakeControlPlane {
        fail_describe: true,
        ..Default::default()
    };
    let service = service(control_plane);
    for uri in ["/getConfig?clientId=MASTER", "/getConfig"] {
        let (status, body) = request_config(service.clone(), uri).await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().is_some_and(|e| e.contains(CHANNEL_NAME)));
    }
    Ok(())
}

#[tokio::test]
async fn stun_entry_does_not_depend_on_control_plane_servers() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let stun = format!("stun:stun.kinesisvideo.{REGION}.amazonaws.com:443");
    let cases = [
        vec![],
        vec![IceServer::stun("stun:stun.example.com:3478")],
        vec![
            IceServer {
                urls: vec!["turns:5-6-7-8.example.com:443?transport=tcp".to_string()],
                username: Some("a".to_string()),
                credential: Some("b".to_string()),
            },
            IceServer {
                urls: vec!["turn:9-9-9-9.example.com:443?transport=udp".to_string()],
                username: Some("c".to_string()),
                credential: Some("d".to_string()),
            },
        ],
    ];
    for returned in cases {
        let control_plane = FakeControlPlane {
            ice_servers: Some(returned.clone()),
            ..Default::default()
        };
        let (status, body) = request_config(service(control_plane), "/getConfig?clientId=MASTER").await?;
        assert_eq!(status, StatusCode::OK);
        let config: ChannelConfig = serde_json::from_value(body)?;
        let ice_servers = config.configuration.ice_servers;
        assert_eq!(ice_servers.len(), returned.len() + 1);
        assert_eq!(ice_servers[0], IceServer::stun(&stun));
        assert_eq!(&ice_servers[1..], &returned[..]);
    }
    Ok(())
}

#[tokio::test]
async fn ice_server_failure_is_a_server_error() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let control_plane = FakeControlPlane {
        fail_ice: true,
        ..Default::default()
    };
    let (status, body) = request_config(service(control_plane), "/getConfig?clientId=MASTER").await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("throttled")));
    Ok(())
}

#[tokio::test]
async fn missing_endpoint_is_a_server_error() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    for (control_plane, protocol) in [
        (
            FakeControlPlane {
                missing_wss: true,
                ..Default::default()
            },
            "WSS",
        ),
        (
            FakeControlPlane {
                missing_https: true,
                ..Default::default()
            },
            "HTTPS",
        ),
    ] {
        let (status, body) = request_config(service(control_plane), "/getConfig").await?;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let error = body["error"].as_str().unwrap_or_default();
        assert_eq!(error, format!("Signalling channel has no {protocol} endpoint!"));
    }
    Ok(())
}

#[tokio::test]
async fn fetch_config_over_http() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(service(FakeControlPlane::default()), "public");
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let server_url = format!("http://{addr}/");
    let master = fetch_config(&server_url, Role::Master).await?;
    assert_eq!(master.client_id, MASTER_CLIENT_ID);
    let viewer = fetch_config(&server_url, Role::Viewer).await?;
    assert_ne!(viewer.client_id, MASTER_CLIENT_ID);

    server.abort();
    Ok(())
}

#[tokio::test]
async fn fetch_config_reports_failure_status() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let control_plane = FakeControlPlane {
        fail_describe: true,
        ..Default::default()
    };
    let app = router(service(control_plane), "public");
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let result = fetch_config(&format!("http://{addr}"), Role::Viewer).await;
    match result {
        Err(ClientError::ConfigStatus(status)) => assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR),
        other => panic!("unexpected result: {other:?}"),
    }

    server.abort();
    Ok(())
}
