//! Credential resolution chains.
//!
//! A chain is an ordered list of [`CredentialStep`]s evaluated lazily: the
//! first step that yields a credential wins and later steps never run. Steps
//! that fail with transport or metadata errors are logged and skipped, while
//! invalid configuration and context interruption abort the whole chain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::common::{Env, LoginConfig, LoginContext};
use crate::error::{BoxError, LoginError, LoginResult};
use crate::metadata::MetadataClient;

pub mod alicloud;
pub mod aws;
pub mod azure;
pub mod gcp;
pub mod tencent;
pub mod yandex;

/// A cloud credential produced by one step of a chain
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    /// Name of the chain step that produced the credential
    pub provider: &'static str,
    /// Provider-specific attributes such as `region` or `kms_key_id`
    pub labels: BTreeMap<&'static str, String>,
}

impl Credential {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        provider: &'static str,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expiration: None,
            provider,
            labels: BTreeMap::new(),
        }
    }

    /// A bearer token credential. `identity` names the principal the token
    /// was issued to and the token itself is kept as the secret.
    pub fn bearer(identity: impl Into<String>, token: impl Into<String>, provider: &'static str) -> Self {
        Self::new(identity, token, provider)
    }

    pub fn with_session_token(mut self, session_token: Option<String>) -> Self {
        self.session_token = session_token.filter(|token| !token.is_empty());
        self
    }

    pub fn with_expiration(mut self, expiration: Option<DateTime<Utc>>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Expiration from a relative lifetime; lifetimes past chrono's range count as unknown
    pub fn expiring_in(self, seconds: Option<i64>) -> Self {
        let expiration = seconds
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        self.with_expiration(expiration)
    }

    pub fn with_label(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.labels.insert(key, value.into());
        self
    }

    pub fn bearer_token(&self) -> &str {
        &self.secret_access_key
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(expiration) if expiration <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .field("expiration", &self.expiration)
            .field("provider", &self.provider)
            .field("labels", &self.labels)
            .finish()
    }
}

/// One source of credentials in a chain
#[async_trait]
pub trait CredentialStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the source is not configured on this host
    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>>;
}

/// Ordered, lazily evaluated credential sources
pub struct CredentialChain {
    provider: &'static str,
    steps: Vec<Box<dyn CredentialStep>>,
}

impl CredentialChain {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl CredentialStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    pub async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Credential> {
        let mut tried = Vec::with_capacity(self.steps.len());
        let mut last_error: Option<LoginError> = None;

        for step in &self.steps {
            if let Some(cause) = ctx.err() {
                return Err(cause.into());
            }
            tried.push(step.name());

            match step.resolve(ctx).await {
                Ok(Some(mut credential)) => {
                    credential.provider = step.name();
                    info!(
                        "Resolved {} credential from {}",
                        self.provider,
                        step.name()
                    );
                    return Ok(credential);
                }
                Ok(None) => {
                    debug!("{} credential step {} not configured", self.provider, step.name());
                }
                Err(e @ LoginError::ConfigInvalid { .. }) => return Err(e),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    warn!(
                        "Skipping {} credential step {}: {}",
                        self.provider,
                        step.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(LoginError::CredentialUnavailable {
            step: format!("credentials/{}", self.provider),
            message: format!("no credential found (tried {})", tried.join(", ")),
            source: last_error.map(|e| Box::new(e) as BoxError),
        })
    }
}

/// Credentials given explicitly in configuration
pub struct StaticStep {
    step: &'static str,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
}

impl StaticStep {
    pub fn new(
        step: &'static str,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            step,
            access_key_id,
            secret_access_key,
            session_token,
        }
    }
}

#[async_trait]
impl CredentialStep for StaticStep {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve(&self, _ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        key_pair(
            self.step,
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            self.session_token.clone(),
        )
    }
}

/// Variable names holding a key pair
#[derive(Debug, Clone, Copy)]
pub struct EnvKeys {
    pub access_key_id: &'static str,
    pub secret_access_key: &'static str,
    pub session_token: &'static str,
}

/// Key pair read from environment variables
pub struct EnvironmentStep {
    step: &'static str,
    keys: EnvKeys,
    env: Arc<dyn Env>,
}

impl EnvironmentStep {
    pub fn new(step: &'static str, keys: EnvKeys, env: Arc<dyn Env>) -> Self {
        Self { step, keys, env }
    }
}

#[async_trait]
impl CredentialStep for EnvironmentStep {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn resolve(&self, _ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        key_pair(
            self.step,
            self.env.non_empty(self.keys.access_key_id),
            self.env.non_empty(self.keys.secret_access_key),
            self.env.non_empty(self.keys.session_token),
        )
    }
}

fn key_pair(
    step: &str,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
) -> LoginResult<Option<Credential>> {
    match (access_key_id, secret_access_key) {
        (Some(access_key_id), Some(secret_access_key)) => Ok(Some(
            Credential::new(access_key_id, secret_access_key, "static")
                .with_session_token(session_token),
        )),
        (None, None) => Ok(None),
        _ => Err(LoginError::config_invalid(format!(
            "{}: access key id and secret access key must be set together",
            step
        ))),
    }
}

/// First role name of a metadata role listing
pub(crate) fn first_listed_role(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(|line| line.trim().trim_end_matches('/'))
        .find(|line| !line.is_empty())
        .map(|line| line.to_string())
}

/// Clouds the resolver knows how to find credentials for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    AliCloud,
    Tencent,
    Yandex,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
            CloudProvider::AliCloud => "alicloud",
            CloudProvider::Tencent => "tencent",
            CloudProvider::Yandex => "yandex",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = LoginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" | "google" => Ok(CloudProvider::Gcp),
            "alicloud" | "alibaba" => Ok(CloudProvider::AliCloud),
            "tencent" | "tencentcloud" => Ok(CloudProvider::Tencent),
            "yandex" | "yandexcloud" => Ok(CloudProvider::Yandex),
            _ => Err(LoginError::config_invalid(format!(
                "unknown cloud provider {:?}",
                s
            ))),
        }
    }
}

/// Builds the credential chain for a provider from a login configuration
#[derive(Clone)]
pub struct CredentialResolver {
    config: Arc<LoginConfig>,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
}

impl CredentialResolver {
    pub fn new(
        config: Arc<LoginConfig>,
        env: Arc<dyn Env>,
        metadata: Arc<dyn MetadataClient>,
    ) -> Self {
        Self {
            config,
            env,
            metadata,
        }
    }

    pub fn chain(&self, provider: CloudProvider) -> LoginResult<CredentialChain> {
        let config = &self.config;
        let env = self.env.clone();
        let metadata = self.metadata.clone();

        match provider {
            CloudProvider::Aws => Ok(aws::chain(&config.aws, env, metadata)),
            CloudProvider::Azure => Ok(azure::chain(config, env.as_ref(), metadata)),
            CloudProvider::Gcp => Ok(gcp::access_token_chain(config, env, metadata)),
            CloudProvider::AliCloud => Ok(alicloud::chain(&config.alicloud, env, metadata)),
            CloudProvider::Tencent => Ok(tencent::chain(&config.tencent, env, metadata)),
            CloudProvider::Yandex => yandex::chain(&config.yandex, env, metadata),
        }
    }

    pub async fn resolve(
        &self,
        ctx: &LoginContext,
        provider: CloudProvider,
    ) -> LoginResult<Credential> {
        self.chain(provider)?.resolve(ctx).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::metadata::{MetadataDocument, MetadataRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Metadata client that fails every call and counts them
    #[derive(Default)]
    pub struct CountingMetadataClient {
        pub calls: AtomicUsize,
    }

    impl CountingMetadataClient {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetadataClient for CountingMetadataClient {
        async fn send(
            &self,
            _ctx: &LoginContext,
            request: MetadataRequest,
        ) -> LoginResult<MetadataDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LoginError::metadata_unavailable(
                format!("metadata/{}", request.provider),
                None,
                None,
                "connection refused",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StaticEnv;

    struct FixedStep {
        name: &'static str,
        result: fn() -> LoginResult<Option<Credential>>,
    }

    #[async_trait]
    impl CredentialStep for FixedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn resolve(&self, _ctx: &LoginContext) -> LoginResult<Option<Credential>> {
            (self.result)()
        }
    }

    #[test]
    fn test_expiring_in() {
        let credential = Credential::bearer("default", "token", "test").expiring_in(Some(3600));
        let expiration = credential.expiration.unwrap();
        assert!(expiration > Utc::now() + chrono::Duration::minutes(59));

        for lifetime in [i64::MAX, i64::MIN, i64::MAX / 1000] {
            let credential =
                Credential::bearer("default", "token", "test").expiring_in(Some(lifetime));
            assert!(credential.expiration.is_none(), "lifetime {}", lifetime);
        }
        assert!(Credential::bearer("default", "token", "test")
            .expiring_in(None)
            .expiration
            .is_none());
    }

    #[tokio::test]
    async fn test_chain_skips_transient_failures() {
        let chain = CredentialChain::new("test")
            .step(FixedStep {
                name: "first",
                result: || Ok(None),
            })
            .step(FixedStep {
                name: "second",
                result: || {
                    Err(LoginError::metadata_unavailable(
                        "metadata/test",
                        None,
                        None,
                        "timed out",
                    ))
                },
            })
            .step(FixedStep {
                name: "third",
                result: || Ok(Some(Credential::new("id", "secret", "anything"))),
            });

        let credential = chain.resolve(&LoginContext::new()).await.unwrap();
        assert_eq!(credential.access_key_id, "id");
        assert_eq!(credential.provider, "third");
    }

    #[tokio::test]
    async fn test_config_invalid_aborts_chain() {
        let chain = CredentialChain::new("test")
            .step(FixedStep {
                name: "broken",
                result: || Err(LoginError::config_invalid("half a key pair")),
            })
            .step(FixedStep {
                name: "never",
                result: || Ok(Some(Credential::new("id", "secret", "never"))),
            });

        let err = chain.resolve(&LoginContext::new()).await.unwrap_err();
        assert!(matches!(err, LoginError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_chain_names_every_step() {
        let chain = CredentialChain::new("test")
            .step(FixedStep {
                name: "environment",
                result: || Ok(None),
            })
            .step(FixedStep {
                name: "instance-metadata",
                result: || {
                    Err(LoginError::metadata_unavailable(
                        "metadata/test",
                        Some(500),
                        None,
                        "boom",
                    ))
                },
            });

        let err = chain.resolve(&LoginContext::new()).await.unwrap_err();
        assert!(!err.is_retryable());
        match &err {
            LoginError::CredentialUnavailable { step, message, source } => {
                assert_eq!(step, "credentials/test");
                assert!(message.contains("environment, instance-metadata"));
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_chain() {
        let chain = CredentialChain::new("test").step(FixedStep {
            name: "environment",
            result: || Ok(Some(Credential::new("id", "secret", "environment"))),
        });
        let ctx = LoginContext::new();
        ctx.cancel();
        assert!(chain.resolve(&ctx).await.unwrap_err().is_interrupted());
    }

    #[tokio::test]
    async fn test_half_set_environment_pair_is_invalid() {
        let env = Arc::new(StaticEnv::new().with("KEY", "AKID"));
        let step = EnvironmentStep::new(
            "credentials/test",
            EnvKeys {
                access_key_id: "KEY",
                secret_access_key: "SECRET",
                session_token: "TOKEN",
            },
            env,
        );
        let err = step.resolve(&LoginContext::new()).await.unwrap_err();
        assert!(matches!(err, LoginError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let credential = Credential::new("AKID", "very-secret", "static")
            .with_session_token(Some("session".to_string()));
        let rendered = format!("{:?}", credential);
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("session\""));
    }

    #[test]
    fn test_first_listed_role() {
        assert_eq!(
            first_listed_role("\nweb-role\nother\n").as_deref(),
            Some("web-role")
        );
        assert_eq!(first_listed_role("  \n"), None);
    }
}
