//! Public entry point: one configured cloud login method.
//!
//! A [`CloudAuth`] is built once, validated up front, and then logs in on
//! demand. Logins on the same instance are exclusive; the EC2 nonce is the
//! only state that changes after construction.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::attestation::gcp::DEFAULT_IAM_CREDENTIALS_ENDPOINT;
use crate::attestation::{system_clock, Attestor, Clock, IamCredentialsClient};
use crate::common::{AuthType, Env, LoginConfig, LoginContext, ProcessEnv, SignatureType, Token};
use crate::credentials::CredentialResolver;
use crate::error::{LoginError, LoginResult};
use crate::login::{LoginDispatcher, LoginRequest};
use crate::metadata::{DefaultMetadataClient, MetadataClient, MetadataEndpoints};

/// A configured cloud identity login method
pub struct CloudAuth {
    config: Arc<LoginConfig>,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
    attestor: Attestor,
    nonce: Mutex<Option<String>>,
    login_lock: tokio::sync::Mutex<()>,
}

impl CloudAuth {
    pub fn builder() -> CloudAuthBuilder {
        CloudAuthBuilder::new()
    }

    pub fn config(&self) -> &LoginConfig {
        &self.config
    }

    pub fn auth_type(&self) -> AuthType {
        self.config.auth_type
    }

    /// Credential resolver sharing this method's environment and metadata client
    pub fn credential_resolver(&self) -> CredentialResolver {
        CredentialResolver::new(self.config.clone(), self.env.clone(), self.metadata.clone())
    }

    /// EC2 nonce currently bound to this instance
    pub fn nonce(&self) -> Option<String> {
        self.nonce_cell().clone()
    }

    /// Bind a caller-chosen EC2 nonce. An existing, different nonce must be
    /// cleared first.
    pub fn set_nonce(&self, nonce: impl Into<String>) -> LoginResult<()> {
        let nonce = nonce.into();
        if self.config.auth_type != AuthType::AwsEc2 {
            return Err(LoginError::config_invalid(format!(
                "option nonce does not apply to {} login",
                self.config.auth_type
            )));
        }
        if nonce.trim().is_empty() {
            return Err(LoginError::config_invalid("nonce must not be empty"));
        }

        let _guard = self.login_lock.try_lock().map_err(|_| LoginError::LoginBusy)?;
        let mut cell = self.nonce_cell();
        match cell.as_deref() {
            Some(existing) if existing != nonce => Err(LoginError::config_invalid(
                "a nonce is already set; clear it before setting another",
            )),
            _ => {
                *cell = Some(nonce);
                Ok(())
            }
        }
    }

    /// Forget the EC2 nonce so the next login generates a new one
    pub fn clear_nonce(&self) -> LoginResult<()> {
        let _guard = self.login_lock.try_lock().map_err(|_| LoginError::LoginBusy)?;
        *self.nonce_cell() = None;
        Ok(())
    }

    fn nonce_cell(&self) -> MutexGuard<'_, Option<String>> {
        self.nonce.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve credentials, build the attestation and submit it once.
    ///
    /// Fails with [`LoginError::LoginBusy`] while another login runs on the
    /// same instance. An interrupted login leaves the instance unchanged. The
    /// EC2 nonce is kept after success and after a transient dispatch failure,
    /// since the server may already have bound it to this instance.
    #[instrument(
        skip(self, ctx, dispatcher),
        fields(auth_type = %self.config.auth_type, mount = %self.config.mount_path())
    )]
    pub async fn login(
        &self,
        ctx: &LoginContext,
        dispatcher: &dyn LoginDispatcher,
    ) -> LoginResult<Token> {
        let _guard = self.login_lock.try_lock().map_err(|_| LoginError::LoginBusy)?;
        if let Some(cause) = ctx.err() {
            return Err(cause.into());
        }

        let nonce = match self.config.auth_type {
            AuthType::AwsEc2 => Some(self.nonce().unwrap_or_else(|| {
                debug!("Generating EC2 nonce");
                Uuid::new_v4().to_string()
            })),
            _ => None,
        };

        let attestation = self
            .attestor
            .attest(ctx, dispatcher.address(), nonce.as_deref())
            .await?;
        let request = LoginRequest::assemble(attestation, &self.config)?;
        let token = match dispatcher.dispatch(ctx, &request).await {
            Ok(token) => token,
            Err(err) => {
                if matches!(err, LoginError::LoginTransientError { .. }) && !err.is_interrupted() {
                    if let Some(nonce) = nonce {
                        debug!("Keeping EC2 nonce after ambiguous dispatch failure");
                        self.nonce_cell().get_or_insert(nonce);
                    }
                }
                return Err(err);
            }
        };

        if let Some(nonce) = nonce {
            self.nonce_cell().get_or_insert(nonce);
        }

        info!(
            "Logged in with {} (lease {}s)",
            self.config.auth_type, token.lease_duration
        );
        Ok(token)
    }
}

/// Builder for [`CloudAuth`]; every option is checked in [`CloudAuthBuilder::build`]
#[derive(Default)]
pub struct CloudAuthBuilder {
    base: Option<LoginConfig>,
    auth_type: Option<AuthType>,
    role: Option<String>,
    mount_path: Option<String>,
    signature_type: Option<SignatureType>,
    iam_server_id_header: Option<String>,
    nonce: Option<String>,
    region: Option<String>,
    resource: Option<String>,
    service_account: Option<String>,
    jwt_ttl_minutes: Option<u32>,
    timeout: Option<Duration>,
    shared_credentials_file: Option<PathBuf>,
    env: Option<Arc<dyn Env>>,
    metadata_client: Option<Arc<dyn MetadataClient>>,
    metadata_endpoints: Option<MetadataEndpoints>,
    iam_credentials_endpoint: Option<String>,
    clock: Option<Clock>,
}

impl CloudAuthBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a full configuration; later options override it
    pub fn from_config(config: LoginConfig) -> Self {
        Self {
            base: Some(config),
            ..Self::default()
        }
    }

    pub fn auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_type = Some(auth_type);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = Some(mount_path.into());
        self
    }

    pub fn signature_type(mut self, signature_type: SignatureType) -> Self {
        self.signature_type = Some(signature_type);
        self
    }

    pub fn iam_server_id_header(mut self, value: impl Into<String>) -> Self {
        self.iam_server_id_header = Some(value.into());
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Azure token audience
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn service_account(mut self, service_account: impl Into<String>) -> Self {
        self.service_account = Some(service_account.into());
        self
    }

    pub fn jwt_ttl_minutes(mut self, minutes: u32) -> Self {
        self.jwt_ttl_minutes = Some(minutes);
        self
    }

    /// Per-request timeout for metadata calls and RPCs
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable the shared credentials file step, reading `path`
    pub fn shared_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_credentials_file = Some(path.into());
        self
    }

    pub fn env(mut self, env: Arc<dyn Env>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn metadata_client(mut self, client: Arc<dyn MetadataClient>) -> Self {
        self.metadata_client = Some(client);
        self
    }

    pub fn metadata_endpoints(mut self, endpoints: MetadataEndpoints) -> Self {
        self.metadata_endpoints = Some(endpoints);
        self
    }

    pub fn iam_credentials_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.iam_credentials_endpoint = Some(endpoint.into());
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    fn into_config(self) -> LoginResult<(LoginConfig, BuildParts)> {
        let mut config = match (self.base, self.auth_type) {
            (Some(mut base), Some(auth_type)) => {
                base.auth_type = auth_type;
                base
            }
            (Some(base), None) => base,
            (None, Some(auth_type)) => LoginConfig::new(auth_type),
            (None, None) => return Err(LoginError::config_invalid("auth type is required")),
        };

        if let Some(role) = self.role {
            config.role = role;
        }
        config.mount_path = self.mount_path.or(config.mount_path);
        config.signature_type = self.signature_type.or(config.signature_type);
        config.iam_server_id_header = self.iam_server_id_header.or(config.iam_server_id_header);
        config.nonce = self.nonce.or(config.nonce);
        config.region = self.region.or(config.region);
        config.resource = self.resource.or(config.resource);
        config.service_account = self.service_account.or(config.service_account);
        config.jwt_ttl_minutes = self.jwt_ttl_minutes.or(config.jwt_ttl_minutes);
        if let Some(timeout) = self.timeout {
            // Values under a millisecond become zero and fail validation
            config.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(path) = self.shared_credentials_file {
            config.aws.use_shared_file = true;
            config.aws.shared_credentials_file = Some(path);
        }

        if self.metadata_client.is_some() && self.metadata_endpoints.is_some() {
            return Err(LoginError::config_invalid(
                "metadata_client and metadata_endpoints are mutually exclusive",
            ));
        }

        Ok((
            config,
            BuildParts {
                env: self.env,
                metadata_client: self.metadata_client,
                metadata_endpoints: self.metadata_endpoints,
                iam_credentials_endpoint: self.iam_credentials_endpoint,
                clock: self.clock,
            },
        ))
    }

    pub fn build(self) -> LoginResult<CloudAuth> {
        let (config, parts) = self.into_config()?;
        config.validate()?;

        let env = parts.env.unwrap_or_else(|| Arc::new(ProcessEnv));
        let metadata = match parts.metadata_client {
            Some(client) => client,
            None => {
                let endpoints = parts
                    .metadata_endpoints
                    .unwrap_or_else(|| MetadataEndpoints::from_env(env.as_ref()));
                Arc::new(DefaultMetadataClient::new(endpoints, config.timeout()))
            }
        };
        let iam_credentials = IamCredentialsClient::new(
            parts
                .iam_credentials_endpoint
                .unwrap_or_else(|| DEFAULT_IAM_CREDENTIALS_ENDPOINT.to_string()),
            config.timeout(),
        );
        let clock = parts.clock.unwrap_or_else(system_clock);

        let nonce = Mutex::new(config.nonce.clone());
        let config = Arc::new(config);
        let attestor = Attestor::new(
            config.clone(),
            env.clone(),
            metadata.clone(),
            iam_credentials,
            clock,
        );

        debug!("Built {} login method", config.auth_type);
        Ok(CloudAuth {
            config,
            env,
            metadata,
            attestor,
            nonce,
            login_lock: tokio::sync::Mutex::new(()),
        })
    }
}

struct BuildParts {
    env: Option<Arc<dyn Env>>,
    metadata_client: Option<Arc<dyn MetadataClient>>,
    metadata_endpoints: Option<MetadataEndpoints>,
    iam_credentials_endpoint: Option<String>,
    clock: Option<Clock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StaticEnv;
    use crate::credentials::testing::CountingMetadataClient;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn token() -> Token {
        Token {
            client_token: "hvs.test".to_string(),
            accessor: String::new(),
            lease_duration: 60,
            renewable: false,
            policies: vec![],
            token_policies: vec![],
            metadata: HashMap::new(),
            entity_id: String::new(),
        }
    }

    /// Records requests; optionally parks until released or fails
    #[derive(Default)]
    struct RecordingDispatcher {
        requests: Mutex<Vec<LoginRequest>>,
        dispatched: AtomicUsize,
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
        failure: Option<fn() -> LoginError>,
    }

    #[async_trait]
    impl LoginDispatcher for RecordingDispatcher {
        fn address(&self) -> &str {
            "https://vault.example.com"
        }

        async fn dispatch(&self, _ctx: &LoginContext, request: &LoginRequest) -> LoginResult<Token> {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            Ok(token())
        }
    }

    fn pcf_env() -> Arc<dyn Env> {
        let fixture = |name: &str| format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
        Arc::new(
            StaticEnv::new()
                .with("CF_INSTANCE_CERT", fixture("instance.crt"))
                .with("CF_INSTANCE_KEY", fixture("instance.key")),
        )
    }

    #[test]
    fn test_build_rejects_misplaced_options() {
        let err = CloudAuth::builder()
            .auth_type(AuthType::Azure)
            .role("r")
            .region("us-west-2")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, LoginError::ConfigInvalid { .. }));

        let err = CloudAuth::builder()
            .auth_type(AuthType::GcpIam)
            .role("r")
            .jwt_ttl_minutes(61)
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("exceeds"));

        assert!(CloudAuth::builder().role("r").build().is_err());
        assert!(CloudAuth::builder()
            .auth_type(AuthType::Pcf)
            .build()
            .is_err());
    }

    #[test]
    fn test_metadata_options_conflict() {
        let err = CloudAuth::builder()
            .auth_type(AuthType::AwsEc2)
            .metadata_client(Arc::new(CountingMetadataClient::default()))
            .metadata_endpoints(MetadataEndpoints::default())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, LoginError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_builder_overrides_config() {
        let config = LoginConfig::from_yaml_str("auth_type: gcp-gce\nrole: base\n").unwrap();
        let auth = CloudAuthBuilder::from_config(config)
            .role("override")
            .mount_path("gcp-prod")
            .env(Arc::new(StaticEnv::new()))
            .build()
            .unwrap();
        assert_eq!(auth.config().role, "override");
        assert_eq!(auth.config().mount_path(), "gcp-prod");
        assert_eq!(auth.auth_type(), AuthType::GcpGce);
    }

    #[test]
    fn test_builder_keeps_sub_second_timeout() {
        let build = |timeout: Duration| {
            CloudAuthBuilder::new()
                .auth_type(AuthType::GcpGce)
                .role("web")
                .env(Arc::new(StaticEnv::new()))
                .timeout(timeout)
                .build()
        };

        let auth = build(Duration::from_millis(500)).unwrap();
        assert_eq!(auth.config().timeout(), Duration::from_millis(500));

        let auth = build(Duration::from_millis(1900)).unwrap();
        assert_eq!(auth.config().timeout(), Duration::from_millis(1900));

        for timeout in [Duration::ZERO, Duration::from_micros(300)] {
            assert!(matches!(
                build(timeout),
                Err(LoginError::ConfigInvalid { .. })
            ));
        }
    }

    #[test]
    fn test_nonce_cell_rejects_overwrite() {
        let auth = CloudAuth::builder()
            .auth_type(AuthType::AwsEc2)
            .nonce("first")
            .metadata_client(Arc::new(CountingMetadataClient::default()))
            .build()
            .unwrap();
        assert_eq!(auth.nonce().as_deref(), Some("first"));
        auth.set_nonce("first").unwrap();
        assert!(auth.set_nonce("second").is_err());

        auth.clear_nonce().unwrap();
        assert_eq!(auth.nonce(), None);
        auth.set_nonce("second").unwrap();
        assert_eq!(auth.nonce().as_deref(), Some("second"));
    }

    #[test]
    fn test_nonce_only_for_ec2() {
        let auth = CloudAuth::builder()
            .auth_type(AuthType::Pcf)
            .role("r")
            .build()
            .unwrap();
        assert!(auth.set_nonce("n").is_err());
    }

    #[tokio::test]
    async fn test_cancelled_context_does_nothing() {
        let metadata = Arc::new(CountingMetadataClient::default());
        let auth = CloudAuth::builder()
            .auth_type(AuthType::AwsEc2)
            .metadata_client(metadata.clone())
            .build()
            .unwrap();
        let dispatcher = RecordingDispatcher::default();

        let ctx = LoginContext::new();
        ctx.cancel();
        let err = auth.login(&ctx, &dispatcher).await.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(metadata.calls(), 0);
        assert_eq!(dispatcher.dispatched.load(Ordering::SeqCst), 0);
        assert_eq!(auth.nonce(), None);
    }

    #[tokio::test]
    async fn test_failed_login_does_not_capture_nonce() {
        let auth = CloudAuth::builder()
            .auth_type(AuthType::AwsEc2)
            .metadata_client(Arc::new(CountingMetadataClient::default()))
            .build()
            .unwrap();
        let err = auth
            .login(&LoginContext::new(), &RecordingDispatcher::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::MetadataUnavailable { .. }));
        assert_eq!(auth.nonce(), None);
    }

    #[tokio::test]
    async fn test_dispatch_timeout_keeps_nonce() {
        use crate::attestation::aws_ec2::PKCS7_PATH;
        use crate::error::Interrupted;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let metadata = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("imds-token"))
            .mount(&metadata)
            .await;
        Mock::given(method("GET"))
            .and(path(PKCS7_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("MIIC...pkcs7..."))
            .mount(&metadata)
            .await;
        let build = || {
            CloudAuth::builder()
                .auth_type(AuthType::AwsEc2)
                .env(Arc::new(StaticEnv::new()))
                .metadata_endpoints(MetadataEndpoints::all(metadata.uri()))
                .build()
                .unwrap()
        };

        let auth = build();
        let timed_out = RecordingDispatcher {
            failure: Some(|| LoginError::transient("login/dispatch", "response timed out")),
            ..Default::default()
        };
        let err = auth.login(&LoginContext::new(), &timed_out).await.unwrap_err();
        assert!(matches!(err, LoginError::LoginTransientError { .. }));
        let nonce = auth.nonce().expect("nonce kept after an ambiguous failure");
        let sent = timed_out.requests.lock().unwrap()[0].body["nonce"].clone();
        assert_eq!(sent, nonce);

        let auth = build();
        let interrupted = RecordingDispatcher {
            failure: Some(|| Interrupted::DeadlineExceeded.into()),
            ..Default::default()
        };
        let err = auth.login(&LoginContext::new(), &interrupted).await.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(auth.nonce(), None);

        let rejected = RecordingDispatcher {
            failure: Some(|| LoginError::rejected(400, vec!["client nonce mismatch".to_string()])),
            ..Default::default()
        };
        auth.login(&LoginContext::new(), &rejected).await.unwrap_err();
        assert_eq!(auth.nonce(), None);
    }

    #[tokio::test]
    async fn test_concurrent_login_is_busy() {
        let gate = Arc::new(Notify::new());
        let dispatcher = Arc::new(RecordingDispatcher {
            gate: Some(gate.clone()),
            ..RecordingDispatcher::default()
        });
        let auth = Arc::new(
            CloudAuth::builder()
                .auth_type(AuthType::Pcf)
                .role("web")
                .env(pcf_env())
                .build()
                .unwrap(),
        );

        let first = {
            let auth = auth.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { auth.login(&LoginContext::new(), dispatcher.as_ref()).await })
        };
        dispatcher.entered.notified().await;

        let err = auth
            .login(&LoginContext::new(), dispatcher.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::LoginBusy));
        assert!(err.is_retryable());
        assert!(matches!(auth.clear_nonce(), Err(LoginError::LoginBusy)));

        gate.notify_one();
        let token = first.await.unwrap().unwrap();
        assert_eq!(token.client_token, "hvs.test");

        let requests = dispatcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path(), "/v1/auth/pcf/login");
        assert_eq!(requests[0].body["role"], "web");
    }
}
