//! SigV4 query-string presigning of signalling endpoints

use std::{collections::BTreeMap, fmt, time::Duration};

use aws_credential_types::Credentials;
use aws_sigv4::{
    http_request::{sign, SignableBody, SignableRequest, SignatureLocation, SigningError, SigningParams, SigningSettings},
    sign::v4::{self, signing_params::BuildError},
};
use chrono::{DateTime, Utc};

const DEFAULT_SERVICE: &str = "kinesisvideo";
/// Lifetime of a presigned URL (just under the 5 minute ceiling)
const EXPIRES_IN: Duration = Duration::from_secs(299);
const WSS_SCHEME: &str = "wss://";

#[derive(thiserror::Error, Debug)]
pub enum SignerError {
    #[error("Endpoint is not a secure WebSocket URL! ({0})")]
    UnsupportedScheme(String),
    #[error("Endpoint must not carry a query string! ({0})")]
    QueryInEndpoint(String),
    #[error("Incomplete signing parameters! ({0})")]
    Params(#[from] BuildError),
    #[error("Failed to sign request! ({0})")]
    Signing(#[from] SigningError),
}

/// Access key pair (and optional session token) used to sign requests
#[derive(Clone, PartialEq, Eq)]
pub struct SigningCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Produces signed, time-limited URLs for opening signalling connections.
///
/// Signing must be a pure function of its inputs: identical arguments yield an identical URL.
pub trait RequestSigner {
    fn sign_url(
        &self,
        endpoint: &str,
        query: &BTreeMap<String, String>,
        date: DateTime<Utc>,
    ) -> Result<String, SignerError>;
}

/// AWS Signature Version 4 presigner for `wss://` endpoints
#[derive(Debug, Clone)]
pub struct SigV4RequestSigner {
    region: String,
    service: String,
    credentials: SigningCredentials,
}

impl SigV4RequestSigner {
    pub fn new(region: impl Into<String>, credentials: SigningCredentials) -> Self {
        Self {
            region: region.into(),
            service: DEFAULT_SERVICE.to_string(),
            credentials,
        }
    }

    /// Override the signing service name (defaults to `kinesisvideo`)
    pub fn set_service(mut self, set: impl Into<String>) -> Self {
        self.service = set.into();
        self
    }
}

impl RequestSigner for SigV4RequestSigner {
    fn sign_url(
        &self,
        endpoint: &str,
        query: &BTreeMap<String, String>,
        date: DateTime<Utc>,
    ) -> Result<String, SignerError> {
        let rest = endpoint
            .strip_prefix(WSS_SCHEME)
            .ok_or_else(|| SignerError::UnsupportedScheme(endpoint.to_string()))?;
        if endpoint.contains('?') {
            return Err(SignerError::QueryInEndpoint(endpoint.to_string()));
        }
        let base = if rest.contains('/') {
            endpoint.to_string()
        } else {
            format!("{endpoint}/")
        };
        let unsigned = format!("{base}?{}", encode_query(query.iter().map(|(k, v)| (k.as_str(), v.as_str()))));

        let identity = Credentials::new(
            &self.credentials.access_key_id,
            &self.credentials.secret_access_key,
            self.credentials.session_token.clone(),
            None,
            "kvs-webrtc-signalling",
        )
        .into();
        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(EXPIRES_IN);
        let params: SigningParams<'_> = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(&self.service)
            .time(date.into())
            .settings(settings)
            .build()?
            .into();

        let request = SignableRequest::new("GET", unsigned.as_str(), std::iter::empty(), SignableBody::Bytes(&[]))?;
        let (instructions, _signature) = sign(request, &params)?.into_parts();
        let signing_query = encode_query(instructions.params().iter().map(|(k, v)| (*k, &**v)));
        Ok(format!("{unsigned}&{signing_query}"))
    }
}

/// RFC 3986 encoded `key=value` pairs
fn encode_query<'a>(params: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    params
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
