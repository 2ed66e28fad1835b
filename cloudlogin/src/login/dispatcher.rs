use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use hyper_tls::HttpsConnector;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::LoginRequest;
use crate::common::types::{ErrorResponse, LoginResponse};
use crate::common::{LoginContext, Token};
use crate::error::{LoginError, LoginResult};

const STEP: &str = "login/dispatch";
const REQUEST_HEADER: &str = "X-Vault-Request";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Sends an assembled login request to the secrets server
#[async_trait]
pub trait LoginDispatcher: Send + Sync {
    /// Base address of the server, used for audiences bound to it
    fn address(&self) -> &str;

    /// POST the request once and return the issued token
    async fn dispatch(&self, ctx: &LoginContext, request: &LoginRequest) -> LoginResult<Token>;
}

/// Default implementation of LoginDispatcher
#[derive(Clone)]
pub struct DefaultLoginDispatcher {
    http_client: Client<HttpsConnector<HttpConnector>>,
    address: String,
    namespace: Option<String>,
    timeout: Duration,
}

impl DefaultLoginDispatcher {
    pub fn new(address: impl Into<String>) -> Self {
        let https = HttpsConnector::new();
        let http_client = Client::builder().build::<_, Body>(https);

        Self {
            http_client,
            address: address.into().trim_end_matches('/').to_string(),
            namespace: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = (!namespace.is_empty()).then_some(namespace);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_request(&self, request: &LoginRequest) -> LoginResult<Request<Body>> {
        let body = serde_json::to_vec(&request.body).map_err(|e| {
            LoginError::attestation_caused(STEP, "failed to encode login body", e)
        })?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.address, request.path()))
            .header(CONTENT_TYPE, "application/json")
            .header(REQUEST_HEADER, "true");
        if let Some(namespace) = &self.namespace {
            builder = builder.header(NAMESPACE_HEADER, namespace);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder
            .body(Body::from(body))
            .map_err(|e| LoginError::config_invalid(format!("invalid login request: {}", e)))
    }
}

#[async_trait]
impl LoginDispatcher for DefaultLoginDispatcher {
    fn address(&self) -> &str {
        &self.address
    }

    #[instrument(skip(self, ctx, request), fields(mount = %request.mount_path))]
    async fn dispatch(&self, ctx: &LoginContext, request: &LoginRequest) -> LoginResult<Token> {
        let http_request = self.build_request(request)?;
        debug!("POST {}{}", self.address, request.path());

        let timeout = self.timeout;
        let exchange = async {
            let response = self.http_client.request(http_request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };
        let (status, bytes) = match ctx.run(tokio::time::timeout(timeout, exchange)).await? {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(LoginError::transient(STEP, e)),
            Err(_) => {
                return Err(LoginError::transient(
                    STEP,
                    format!("login request timed out after {:?}", timeout),
                ))
            }
        };

        if status.is_client_error() {
            let envelope: ErrorResponse = serde_json::from_slice(&bytes).unwrap_or_default();
            let errors = if envelope.errors.is_empty() {
                vec![String::from_utf8_lossy(&bytes).trim().to_string()]
            } else {
                envelope.errors
            };
            warn!("Login rejected with status {}", status.as_u16());
            return Err(LoginError::rejected(status.as_u16(), errors));
        }

        if !status.is_success() {
            let envelope: ErrorResponse = serde_json::from_slice(&bytes).unwrap_or_default();
            let message = if envelope.errors.is_empty() {
                String::from_utf8_lossy(&bytes).trim().to_string()
            } else {
                envelope.errors.join("\n")
            };
            return Err(LoginError::server_error(status.as_u16(), message));
        }

        let response: LoginResponse = serde_json::from_slice(&bytes).map_err(|e| {
            LoginError::server_error(status.as_u16(), format!("malformed login response: {}", e))
        })?;
        for warning in response.warnings.iter().flatten() {
            warn!("Server warning: {}", warning);
        }

        let token = response.auth.ok_or_else(|| {
            LoginError::server_error(status.as_u16(), "login response carried no auth data")
        })?;
        info!(
            "Login succeeded (accessor {}, lease {}s)",
            token.accessor, token.lease_duration
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> LoginRequest {
        let mut body = BTreeMap::new();
        body.insert("role".to_string(), "dev".to_string());
        body.insert("jwt".to_string(), "eyJ".to_string());
        LoginRequest {
            mount_path: "gcp".to_string(),
            body,
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn test_successful_login_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/auth/gcp/login"))
            .and(header("X-Vault-Request", "true"))
            .and(header("X-Vault-Namespace", "team-a"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(serde_json::json!({"role": "dev", "jwt": "eyJ"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "auth": {
                    "client_token": "hvs.abc",
                    "accessor": "acc",
                    "lease_duration": 2764800,
                    "renewable": true,
                    "policies": ["default", "dev"]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = DefaultLoginDispatcher::new(server.uri()).with_namespace("team-a");
        let token = dispatcher
            .dispatch(&LoginContext::new(), &request())
            .await
            .unwrap();
        assert_eq!(token.client_token, "hvs.abc");
        assert_eq!(token.policies, vec!["default", "dev"]);
    }

    #[tokio::test]
    async fn test_client_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "errors": ["permission denied", "role \"dev\" not bound"]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = DefaultLoginDispatcher::new(server.uri())
            .dispatch(&LoginContext::new(), &request())
            .await
            .unwrap_err();
        match &err {
            LoginError::LoginRejected { status, message, errors } => {
                assert_eq!(*status, 403);
                assert_eq!(errors.len(), 2);
                assert_eq!(message, "permission denied\nrole \"dev\" not bound");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("sealed"))
            .expect(1)
            .mount(&server)
            .await;

        let err = DefaultLoginDispatcher::new(server.uri())
            .dispatch(&LoginContext::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::LoginServerError { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_auth_block() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"auth": null, "warnings": ["odd"]})),
            )
            .mount(&server)
            .await;

        let err = DefaultLoginDispatcher::new(server.uri())
            .dispatch(&LoginContext::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::LoginServerError { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let err = DefaultLoginDispatcher::new("http://127.0.0.1:1")
            .dispatch(&LoginContext::new(), &request())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::LoginTransientError { .. }));
        assert!(!err.is_interrupted());
    }

    #[test]
    fn test_extra_headers_are_forwarded() {
        let mut login = request();
        login
            .headers
            .push(("X-Vault-AWS-IAM-Server-ID".to_string(), "vault.example.com".to_string()));
        let http_request = DefaultLoginDispatcher::new("https://vault.example.com:8200/")
            .build_request(&login)
            .unwrap();
        assert_eq!(
            http_request.uri().to_string(),
            "https://vault.example.com:8200/v1/auth/gcp/login"
        );
        assert_eq!(
            http_request.headers()["X-Vault-AWS-IAM-Server-ID"],
            "vault.example.com"
        );
        assert!(http_request.headers().get(NAMESPACE_HEADER).is_none());
    }
}
