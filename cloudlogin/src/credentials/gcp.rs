use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::{Credential, CredentialChain, CredentialStep};
use crate::common::env::{self, Env};
use crate::common::{LoginConfig, LoginContext};
use crate::error::LoginResult;
use crate::metadata::{MetadataClient, MetadataProvider, MetadataRequest};

pub const SERVICE_ACCOUNTS_PATH: &str = "/computeMetadata/v1/instance/service-accounts";

/// Service account from config, else the instance's default account email
pub async fn service_account(
    config: &LoginConfig,
    client: &dyn MetadataClient,
    ctx: &LoginContext,
) -> LoginResult<String> {
    if let Some(account) = config.service_account.as_deref().filter(|a| !a.is_empty()) {
        return Ok(account.to_string());
    }
    client
        .send(
            ctx,
            MetadataRequest::get(
                MetadataProvider::Gcp,
                format!("{}/default/email", SERVICE_ACCOUNTS_PATH),
            ),
        )
        .await?
        .text("metadata/gcp")
}

/// OAuth access token: config, then `GOOGLE_OAUTH_ACCESS_TOKEN`, then the metadata server
pub fn access_token_chain(
    config: &LoginConfig,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
) -> CredentialChain {
    CredentialChain::new("gcp")
        .step(StaticTokenStep {
            token: config.gcp_access_token.clone(),
        })
        .step(EnvTokenStep { env })
        .step(MetadataTokenStep { client: metadata })
}

pub struct StaticTokenStep {
    token: Option<String>,
}

#[async_trait]
impl CredentialStep for StaticTokenStep {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve(&self, _ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        Ok(self
            .token
            .as_ref()
            .filter(|token| !token.is_empty())
            .map(|token| Credential::bearer("oauth", token.clone(), "static")))
    }
}

pub struct EnvTokenStep {
    env: Arc<dyn Env>,
}

#[async_trait]
impl CredentialStep for EnvTokenStep {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn resolve(&self, _ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        Ok(self
            .env
            .non_empty(env::GOOGLE_OAUTH_ACCESS_TOKEN)
            .map(|token| Credential::bearer("oauth", token, "environment")))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct MetadataTokenStep {
    client: Arc<dyn MetadataClient>,
}

#[async_trait]
impl CredentialStep for MetadataTokenStep {
    fn name(&self) -> &'static str {
        "instance-metadata"
    }

    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        let token: TokenResponse = self
            .client
            .send(
                ctx,
                MetadataRequest::get(
                    MetadataProvider::Gcp,
                    format!("{}/default/token", SERVICE_ACCOUNTS_PATH),
                ),
            )
            .await?
            .json("metadata/gcp")?;

        Ok(Some(
            Credential::bearer("default", token.access_token, "instance-metadata")
                .expiring_in(token.expires_in),
        ))
    }
}
