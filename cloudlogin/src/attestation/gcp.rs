use chrono::{DateTime, Utc};
use hyper::client::HttpConnector;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request};
use hyper_tls::HttpsConnector;
use percent_encoding::utf8_percent_encode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Attestation, QUERY_ENCODE_SET};
use crate::common::LoginContext;
use crate::credentials::gcp::SERVICE_ACCOUNTS_PATH;
use crate::credentials::Credential;
use crate::error::{LoginError, LoginResult};
use crate::metadata::{MetadataClient, MetadataProvider, MetadataRequest};

pub const DEFAULT_IAM_CREDENTIALS_ENDPOINT: &str = "https://iamcredentials.googleapis.com";
const IAM_STEP: &str = "attestation/gcp-iam";

/// Audience the server expects in GCE identity tokens
pub fn gce_audience(server_address: &str, role: &str) -> String {
    format!("{}/vault/{}", server_address.trim_end_matches('/'), role)
}

/// Identity token minted by the metadata server for `service_account`
pub async fn build_gce(
    client: &dyn MetadataClient,
    ctx: &LoginContext,
    service_account: &str,
    server_address: &str,
    role: &str,
) -> LoginResult<Attestation> {
    let audience = gce_audience(server_address, role);
    let path = format!(
        "{}/{}/identity?audience={}&format=full",
        SERVICE_ACCOUNTS_PATH,
        service_account,
        utf8_percent_encode(&audience, QUERY_ENCODE_SET)
    );

    let signed_jwt = client
        .send(ctx, MetadataRequest::get(MetadataProvider::Gcp, path))
        .await?
        .text("metadata/gcp")?;

    Ok(Attestation::GcpJwt { signed_jwt })
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    aud: String,
    sub: &'a str,
    exp: i64,
}

#[derive(Debug, Serialize)]
struct SignJwtRequest {
    payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignJwtResponse {
    signed_jwt: String,
}

#[derive(Debug, Default, Deserialize)]
struct GoogleErrorEnvelope {
    #[serde(default)]
    error: GoogleError,
}

#[derive(Debug, Default, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Client for the IAM Credentials `signJwt` RPC
#[derive(Clone)]
pub struct IamCredentialsClient {
    http_client: Client<HttpsConnector<HttpConnector>>,
    endpoint: String,
    timeout: Duration,
}

impl IamCredentialsClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let https = HttpsConnector::new();
        let http_client = Client::builder().build::<_, Body>(https);

        Self {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Have Google sign `payload` with the service account's system-managed key
    pub async fn sign_jwt(
        &self,
        ctx: &LoginContext,
        access_token: &Credential,
        service_account: &str,
        payload: String,
    ) -> LoginResult<String> {
        let url = format!(
            "{}/v1/projects/-/serviceAccounts/{}:signJwt",
            self.endpoint, service_account
        );
        let body = serde_json::to_vec(&SignJwtRequest { payload })
            .map_err(|e| LoginError::attestation_caused(IAM_STEP, "failed to encode signJwt request", e))?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header(AUTHORIZATION, format!("Bearer {}", access_token.bearer_token()))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .map_err(|e| LoginError::attestation_caused(IAM_STEP, "invalid signJwt request", e))?;

        debug!("Calling signJwt for {}", service_account);

        let timeout = self.timeout;
        let exchange = async {
            let response = self.http_client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };
        let (status, bytes) = match ctx.run(tokio::time::timeout(timeout, exchange)).await? {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(LoginError::transient(IAM_STEP, e)),
            Err(_) => {
                return Err(LoginError::transient(
                    IAM_STEP,
                    format!("signJwt timed out after {:?}", timeout),
                ))
            }
        };

        if !status.is_success() {
            let envelope: GoogleErrorEnvelope = serde_json::from_slice(&bytes).unwrap_or_default();
            let message = if envelope.error.message.is_empty() {
                String::from_utf8_lossy(&bytes).trim().to_string()
            } else {
                format!("{}: {}", envelope.error.status, envelope.error.message)
            };
            return Err(LoginError::attestation(
                IAM_STEP,
                format!("signJwt failed (status {}): {}", status.as_u16(), message),
            ));
        }

        let response: SignJwtResponse = serde_json::from_slice(&bytes)
            .map_err(|e| LoginError::attestation_caused(IAM_STEP, "malformed signJwt response", e))?;
        Ok(response.signed_jwt)
    }
}

/// JWT for `role` signed by the IAM Credentials API on behalf of `service_account`
pub async fn build_iam(
    iam: &IamCredentialsClient,
    ctx: &LoginContext,
    access_token: &Credential,
    service_account: &str,
    role: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> LoginResult<Attestation> {
    let claims = JwtClaims {
        aud: format!("http://vault/{}", role),
        sub: service_account,
        exp: now.timestamp() + ttl.as_secs() as i64,
    };
    let payload = serde_json::to_string(&claims)
        .map_err(|e| LoginError::attestation_caused(IAM_STEP, "failed to encode claims", e))?;

    let signed_jwt = iam.sign_jwt(ctx, access_token, service_account, payload).await?;
    Ok(Attestation::GcpJwt { signed_jwt })
}
