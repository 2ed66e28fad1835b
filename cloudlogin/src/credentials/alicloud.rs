use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{
    first_listed_role, Credential, CredentialChain, CredentialStep, EnvKeys, EnvironmentStep,
    StaticStep,
};
use crate::common::env::{self, Env};
use crate::common::{KeyPairConfig, LoginContext};
use crate::error::{LoginError, LoginResult};
use crate::metadata::{MetadataClient, MetadataProvider, MetadataRequest};

const STEP: &str = "credentials/alicloud";
const RAM_CREDENTIALS_PATH: &str = "/latest/meta-data/ram/security-credentials/";

pub const ENV_KEYS: EnvKeys = EnvKeys {
    access_key_id: env::ALICLOUD_ACCESS_KEY,
    secret_access_key: env::ALICLOUD_SECRET_KEY,
    session_token: env::ALICLOUD_SECURITY_TOKEN,
};

/// Static config, then environment, then the ECS RAM role
pub fn chain(
    config: &KeyPairConfig,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
) -> CredentialChain {
    CredentialChain::new("alicloud")
        .step(StaticStep::new(
            STEP,
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
        ))
        .step(EnvironmentStep::new(STEP, ENV_KEYS, env))
        .step(RamRoleStep {
            role: config.metadata_role.clone(),
            client: metadata,
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RamCredentials {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    access_key_secret: String,
    #[serde(default)]
    security_token: Option<String>,
    #[serde(default)]
    expiration: Option<DateTime<Utc>>,
}

/// RAM role credentials from the ECS metadata service
pub struct RamRoleStep {
    role: Option<String>,
    client: Arc<dyn MetadataClient>,
}

#[async_trait]
impl CredentialStep for RamRoleStep {
    fn name(&self) -> &'static str {
        "instance-metadata"
    }

    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        let role = match &self.role {
            Some(role) => role.clone(),
            None => {
                let listing = self
                    .client
                    .send(
                        ctx,
                        MetadataRequest::get(MetadataProvider::AliCloud, RAM_CREDENTIALS_PATH),
                    )
                    .await?
                    .text("metadata/alicloud")?;
                match first_listed_role(&listing) {
                    Some(role) => role,
                    None => return Ok(None),
                }
            }
        };
        debug!("Reading credentials of RAM role {}", role);

        let credentials: RamCredentials = self
            .client
            .send(
                ctx,
                MetadataRequest::get(
                    MetadataProvider::AliCloud,
                    format!("{}{}", RAM_CREDENTIALS_PATH, role),
                ),
            )
            .await?
            .json("metadata/alicloud")?;

        if let Some(code) = credentials.code.filter(|code| code != "Success") {
            return Err(LoginError::metadata_unavailable(
                "metadata/alicloud",
                None,
                Some(code),
                format!("RAM role {} has no usable credentials", role),
            ));
        }

        Ok(Some(
            Credential::new(
                credentials.access_key_id,
                credentials.access_key_secret,
                "instance-metadata",
            )
            .with_session_token(credentials.security_token)
            .with_expiration(credentials.expiration)
            .with_label("role", role),
        ))
    }
}
