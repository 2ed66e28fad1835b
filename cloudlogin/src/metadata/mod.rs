//! Link-local instance metadata services.
//!
//! Every cloud exposes identity material on a well-known address reachable
//! only from inside the instance. [`DefaultMetadataClient`] talks to those
//! endpoints over plain HTTP, without proxies and without retries, bounding
//! every call by its own timeout and by the login context.

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::common::env::{self, Env};
use crate::common::LoginContext;
use crate::error::{LoginError, LoginResult};

pub mod imds;

pub use imds::ImdsSession;

/// Metadata service family; selects the endpoint, headers and error envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataProvider {
    Aws,
    Azure,
    Gcp,
    AliCloud,
    Tencent,
    Yandex,
}

impl MetadataProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataProvider::Aws => "aws",
            MetadataProvider::Azure => "azure",
            MetadataProvider::Gcp => "gcp",
            MetadataProvider::AliCloud => "alicloud",
            MetadataProvider::Tencent => "tencent",
            MetadataProvider::Yandex => "yandex",
        }
    }

    fn step(&self) -> String {
        format!("metadata/{}", self.as_str())
    }

    fn required_header(&self) -> Option<(&'static str, &'static str)> {
        match self {
            MetadataProvider::Gcp | MetadataProvider::Yandex => {
                Some(("Metadata-Flavor", "Google"))
            }
            MetadataProvider::Azure => Some(("Metadata", "true")),
            MetadataProvider::Aws | MetadataProvider::AliCloud | MetadataProvider::Tencent => None,
        }
    }
}

impl fmt::Display for MetadataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw response of a metadata call
#[derive(Debug, Clone)]
pub struct MetadataDocument {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

impl MetadataDocument {
    /// Body as UTF-8 with surrounding whitespace removed
    pub fn text(&self, step: &str) -> LoginResult<String> {
        std::str::from_utf8(&self.body)
            .map(|s| s.trim().to_string())
            .map_err(|e| {
                LoginError::metadata_unavailable(
                    step,
                    None,
                    None,
                    format!("response is not valid UTF-8: {}", e),
                )
            })
    }

    pub fn json<T: DeserializeOwned>(&self, step: &str) -> LoginResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| LoginError::MetadataUnavailable {
            step: step.to_string(),
            status: None,
            code: None,
            description: "failed to decode metadata response".to_string(),
            source: Some(Box::new(e)),
        })
    }
}

/// A single metadata call
#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub provider: MetadataProvider,
    pub method: Method,
    /// Path and query, starting with `/`
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl MetadataRequest {
    pub fn get(provider: MetadataProvider, path: impl Into<String>) -> Self {
        Self {
            provider,
            method: Method::GET,
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn put(provider: MetadataProvider, path: impl Into<String>) -> Self {
        Self {
            method: Method::PUT,
            ..Self::get(provider, path)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Client for link-local metadata services
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Issue a request, returning the body of a 2xx response
    async fn send(
        &self,
        ctx: &LoginContext,
        request: MetadataRequest,
    ) -> LoginResult<MetadataDocument>;
}

/// Base URLs of the metadata services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEndpoints {
    pub aws: String,
    pub azure: String,
    pub gcp: String,
    pub alicloud: String,
    pub tencent: String,
    pub yandex: String,
}

impl Default for MetadataEndpoints {
    fn default() -> Self {
        Self {
            aws: "http://169.254.169.254".to_string(),
            azure: "http://169.254.169.254".to_string(),
            gcp: "http://metadata.google.internal".to_string(),
            alicloud: "http://100.100.100.200".to_string(),
            tencent: "http://metadata.tencentyun.com".to_string(),
            yandex: "http://169.254.169.254".to_string(),
        }
    }
}

impl MetadataEndpoints {
    /// Defaults with the overrides SDKs honour from the environment applied
    pub fn from_env(env: &dyn Env) -> Self {
        let mut endpoints = Self::default();
        if let Some(host) = env.non_empty(env::GCE_METADATA_HOST) {
            endpoints.gcp = format!("http://{}", host.trim_end_matches('/'));
        }
        if let Some(endpoint) = env.non_empty(env::AWS_EC2_METADATA_SERVICE_ENDPOINT) {
            endpoints.aws = endpoint.trim_end_matches('/').to_string();
        }
        endpoints
    }

    pub fn get(&self, provider: MetadataProvider) -> &str {
        match provider {
            MetadataProvider::Aws => &self.aws,
            MetadataProvider::Azure => &self.azure,
            MetadataProvider::Gcp => &self.gcp,
            MetadataProvider::AliCloud => &self.alicloud,
            MetadataProvider::Tencent => &self.tencent,
            MetadataProvider::Yandex => &self.yandex,
        }
    }

    /// Point every provider at the same base URL, e.g. a local stub
    pub fn all(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self {
            aws: base.clone(),
            azure: base.clone(),
            gcp: base.clone(),
            alicloud: base.clone(),
            tencent: base.clone(),
            yandex: base,
        }
    }

    pub fn with(mut self, provider: MetadataProvider, base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        match provider {
            MetadataProvider::Aws => self.aws = base,
            MetadataProvider::Azure => self.azure = base,
            MetadataProvider::Gcp => self.gcp = base,
            MetadataProvider::AliCloud => self.alicloud = base,
            MetadataProvider::Tencent => self.tencent = base,
            MetadataProvider::Yandex => self.yandex = base,
        }
        self
    }
}

/// Default implementation of MetadataClient
#[derive(Clone)]
pub struct DefaultMetadataClient {
    http_client: Client<HttpConnector, Body>,
    endpoints: MetadataEndpoints,
    timeout: Duration,
}

impl DefaultMetadataClient {
    pub fn new(endpoints: MetadataEndpoints, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);
        let http_client = Client::builder().build::<_, Body>(connector);

        Self {
            http_client,
            endpoints,
            timeout,
        }
    }

    pub fn endpoints(&self) -> &MetadataEndpoints {
        &self.endpoints
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self, request: MetadataRequest) -> LoginResult<MetadataDocument> {
        let step = request.provider.step();
        let url = format!(
            "{}{}",
            self.endpoints.get(request.provider),
            request.path
        );

        let mut builder = Request::builder().method(request.method.clone()).uri(&url);
        if let Some((name, value)) = request.provider.required_header() {
            builder = builder.header(name, value);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let http_request = builder.body(Body::empty()).map_err(|e| {
            LoginError::metadata_unavailable(&step, None, None, format!("invalid request: {}", e))
        })?;

        debug!("Metadata {} {}", request.method, url);

        let response = self
            .http_client
            .request(http_request)
            .await
            .map_err(|e| LoginError::metadata_transport(&step, e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| LoginError::metadata_transport(&step, e))?;

        if !status.is_success() {
            debug!("Metadata {} returned status {}", url, status);
            return Err(decode_error_envelope(
                request.provider,
                &step,
                status.as_u16(),
                &body,
            ));
        }

        Ok(MetadataDocument {
            body: body.to_vec(),
            content_type,
        })
    }
}

#[async_trait]
impl MetadataClient for DefaultMetadataClient {
    async fn send(
        &self,
        ctx: &LoginContext,
        request: MetadataRequest,
    ) -> LoginResult<MetadataDocument> {
        let step = request.provider.step();
        let timeout = self.timeout;

        match ctx.run(tokio::time::timeout(timeout, self.execute(request))).await? {
            Ok(result) => result,
            Err(_) => Err(LoginError::metadata_unavailable(
                step,
                None,
                None,
                format!("request timed out after {:?}", timeout),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AzureErrorEnvelope {
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Deserialize)]
struct CodeMessageEnvelope {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

fn decode_error_envelope(
    provider: MetadataProvider,
    step: &str,
    status: u16,
    body: &[u8],
) -> LoginError {
    let text = String::from_utf8_lossy(body).trim().to_string();

    let decoded = match provider {
        MetadataProvider::Azure => serde_json::from_slice::<AzureErrorEnvelope>(body)
            .map(|envelope| (envelope.error, envelope.error_description)),
        MetadataProvider::AliCloud | MetadataProvider::Tencent => {
            serde_json::from_slice::<CodeMessageEnvelope>(body)
                .map(|envelope| (envelope.code, envelope.message))
        }
        MetadataProvider::Aws | MetadataProvider::Gcp | MetadataProvider::Yandex => {
            return LoginError::metadata_unavailable(step, Some(status), None, text);
        }
    };

    match decoded {
        Ok((code, description)) => {
            LoginError::metadata_unavailable(step, Some(status), Some(code), description)
        }
        Err(e) => LoginError::MetadataUnavailable {
            step: step.to_string(),
            status: Some(status),
            code: None,
            description: format!("undecodable error response: {}", text),
            source: Some(Box::new(e)),
        },
    }
}
