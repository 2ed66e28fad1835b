use async_trait::async_trait;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::profile::ProfileFileCredentialsProvider;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::ProvideCredentials;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::{
    first_listed_role, Credential, CredentialChain, CredentialStep, EnvKeys, EnvironmentStep,
    StaticStep,
};
use crate::common::config::AwsCredentialsConfig;
use crate::common::env::{self, Env};
use crate::common::LoginContext;
use crate::error::{LoginError, LoginResult};
use crate::metadata::{ImdsSession, MetadataClient};

const STEP: &str = "credentials/aws";
const SECURITY_CREDENTIALS_PATH: &str = "/latest/meta-data/iam/security-credentials/";

pub const ENV_KEYS: EnvKeys = EnvKeys {
    access_key_id: env::AWS_ACCESS_KEY_ID,
    secret_access_key: env::AWS_SECRET_ACCESS_KEY,
    session_token: env::AWS_SESSION_TOKEN,
};

/// Environment, static config, shared file (when enabled), then instance metadata
pub fn chain(
    config: &AwsCredentialsConfig,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
) -> CredentialChain {
    let mut chain = CredentialChain::new("aws")
        .step(EnvironmentStep::new(STEP, ENV_KEYS, env.clone()))
        .step(StaticStep::new(
            STEP,
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
        ));

    if config.use_shared_file {
        chain = chain.step(SharedFileStep::new(config, env.as_ref()));
    }

    chain.step(InstanceMetadataStep::new(metadata))
}

/// Profile in the shared credentials file
pub struct SharedFileStep {
    path: Option<PathBuf>,
    profile: String,
}

impl SharedFileStep {
    pub fn new(config: &AwsCredentialsConfig, env: &dyn Env) -> Self {
        let path = env
            .non_empty(env::AWS_SHARED_CREDENTIALS_FILE)
            .map(PathBuf::from)
            .or_else(|| config.shared_credentials_file.clone());
        let profile = config
            .profile
            .clone()
            .or_else(|| env.non_empty(env::AWS_PROFILE))
            .unwrap_or_else(|| "default".to_string());

        Self { path, profile }
    }
}

#[async_trait]
impl CredentialStep for SharedFileStep {
    fn name(&self) -> &'static str {
        "shared-file"
    }

    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        let files = match &self.path {
            Some(path) => ProfileFiles::builder()
                .with_file(ProfileFileKind::Credentials, path)
                .build(),
            None => ProfileFiles::builder()
                .include_default_credentials_file(true)
                .build(),
        };

        debug!(
            "Reading profile {} from {}",
            self.profile,
            self.path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "the default credentials file".to_string())
        );

        let provider = ProfileFileCredentialsProvider::builder()
            .profile_files(files)
            .profile_name(&self.profile)
            .build();

        match ctx.run(provider.provide_credentials()).await? {
            Ok(credentials) => Ok(Some(
                Credential::new(
                    credentials.access_key_id(),
                    credentials.secret_access_key(),
                    "shared-file",
                )
                .with_session_token(credentials.session_token().map(str::to_string))
                .with_expiration(credentials.expiry().map(DateTime::<Utc>::from)),
            )),
            Err(CredentialsError::CredentialsNotLoaded(_)) => Ok(None),
            Err(CredentialsError::InvalidConfiguration(e)) => Err(LoginError::config_invalid(
                format!("{}/shared-file: {:?}", STEP, e),
            )),
            Err(e) => Err(LoginError::CredentialUnavailable {
                step: format!("{}/shared-file", STEP),
                message: "failed to load shared credentials".to_string(),
                source: Some(Box::new(e)),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    secret_access_key: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

/// Instance profile role credentials from IMDS
pub struct InstanceMetadataStep {
    client: Arc<dyn MetadataClient>,
}

impl InstanceMetadataStep {
    pub fn new(client: Arc<dyn MetadataClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialStep for InstanceMetadataStep {
    fn name(&self) -> &'static str {
        "instance-metadata"
    }

    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        let session = match ImdsSession::open(self.client.as_ref(), ctx).await {
            Ok(session) => session,
            Err(LoginError::MetadataUnavailable {
                status: Some(404), ..
            }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let listing = session.get_text(ctx, SECURITY_CREDENTIALS_PATH).await?;
        let role = match first_listed_role(&listing) {
            Some(role) => role,
            None => return Ok(None),
        };
        debug!("Reading credentials of instance role {}", role);

        let document = session
            .get(ctx, &format!("{}{}", SECURITY_CREDENTIALS_PATH, role))
            .await?;
        let credentials: RoleCredentials = document.json("metadata/aws")?;

        if let Some(code) = credentials.code.filter(|code| code != "Success") {
            return Err(LoginError::metadata_unavailable(
                "metadata/aws",
                None,
                Some(code),
                format!("role {} has no usable credentials", role),
            ));
        }

        Ok(Some(
            Credential::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                "instance-metadata",
            )
            .with_session_token(credentials.token)
            .with_expiration(credentials.expiration)
            .with_label("role", role),
        ))
    }
}
