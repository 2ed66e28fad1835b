use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use percent_encoding::utf8_percent_encode;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::{Credential, CredentialChain, CredentialStep};
use crate::attestation::QUERY_ENCODE_SET;
use crate::common::env::{self, Env};
use crate::common::{LoginConfig, LoginContext};
use crate::error::LoginResult;
use crate::metadata::{MetadataClient, MetadataProvider, MetadataRequest};

pub const API_VERSION: &str = "2021-05-01";
const TOKEN_PATH: &str = "/metadata/identity/oauth2/token";

/// Managed identity to request tokens for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedIdentity {
    SystemAssigned,
    ClientId(String),
    ObjectId(String),
    ResourceId(String),
}

impl ManagedIdentity {
    /// Config selector, then `AZURE_CLIENT_ID`, then the system-assigned identity
    pub fn resolve(config: &LoginConfig, env: &dyn Env) -> Self {
        let azure = &config.azure;
        if let Some(client_id) = &azure.client_id {
            return ManagedIdentity::ClientId(client_id.clone());
        }
        if let Some(object_id) = &azure.object_id {
            return ManagedIdentity::ObjectId(object_id.clone());
        }
        if let Some(resource_id) = &azure.mi_res_id {
            return ManagedIdentity::ResourceId(resource_id.clone());
        }
        match env.non_empty(env::AZURE_CLIENT_ID) {
            Some(client_id) => ManagedIdentity::ClientId(client_id),
            None => ManagedIdentity::SystemAssigned,
        }
    }

    fn query_param(&self) -> Option<(&'static str, &str)> {
        match self {
            ManagedIdentity::SystemAssigned => None,
            ManagedIdentity::ClientId(id) => Some(("client_id", id)),
            ManagedIdentity::ObjectId(id) => Some(("object_id", id)),
            ManagedIdentity::ResourceId(id) => Some(("mi_res_id", id)),
        }
    }

    fn label(&self) -> &str {
        match self {
            ManagedIdentity::SystemAssigned => "system-assigned",
            ManagedIdentity::ClientId(id)
            | ManagedIdentity::ObjectId(id)
            | ManagedIdentity::ResourceId(id) => id,
        }
    }
}

/// Managed identity access token for `resource`
pub fn chain(config: &LoginConfig, env: &dyn Env, metadata: Arc<dyn MetadataClient>) -> CredentialChain {
    CredentialChain::new("azure").step(ManagedIdentityStep::new(
        ManagedIdentity::resolve(config, env),
        config.resource().to_string(),
        metadata,
    ))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    expires_on: Option<String>,
}

pub struct ManagedIdentityStep {
    identity: ManagedIdentity,
    resource: String,
    client: Arc<dyn MetadataClient>,
}

impl ManagedIdentityStep {
    pub fn new(identity: ManagedIdentity, resource: String, client: Arc<dyn MetadataClient>) -> Self {
        Self {
            identity,
            resource,
            client,
        }
    }

    fn token_path(&self) -> String {
        let mut path = format!(
            "{}?api-version={}&resource={}",
            TOKEN_PATH,
            API_VERSION,
            utf8_percent_encode(&self.resource, QUERY_ENCODE_SET)
        );
        if let Some((name, value)) = self.identity.query_param() {
            path.push_str(&format!(
                "&{}={}",
                name,
                utf8_percent_encode(value, QUERY_ENCODE_SET)
            ));
        }
        path
    }
}

#[async_trait]
impl CredentialStep for ManagedIdentityStep {
    fn name(&self) -> &'static str {
        "managed-identity"
    }

    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        debug!(
            "Requesting managed identity token for {} ({})",
            self.resource,
            self.identity.label()
        );
        let document = self
            .client
            .send(ctx, MetadataRequest::get(MetadataProvider::Azure, self.token_path()))
            .await?;
        let token: TokenResponse = document.json("metadata/azure")?;

        let expiration = token.expires_on.as_deref().and_then(parse_expiration);
        let identity = token
            .client_id
            .unwrap_or_else(|| self.identity.label().to_string());

        Ok(Some(
            Credential::bearer(identity, token.access_token, "managed-identity")
                .with_expiration(expiration)
                .with_label("resource", self.resource.clone()),
        ))
    }
}

fn parse_expiration(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{AuthType, StaticEnv};
    use crate::metadata::{DefaultMetadataClient, MetadataEndpoints};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_identity_precedence() {
        let mut config = LoginConfig::new(AuthType::Azure);
        let env = StaticEnv::new().with(env::AZURE_CLIENT_ID, "env-client");
        assert_eq!(
            ManagedIdentity::resolve(&config, &env),
            ManagedIdentity::ClientId("env-client".to_string())
        );

        config.azure.object_id = Some("obj".to_string());
        assert_eq!(
            ManagedIdentity::resolve(&config, &env),
            ManagedIdentity::ObjectId("obj".to_string())
        );

        let config = LoginConfig::new(AuthType::Azure);
        assert_eq!(
            ManagedIdentity::resolve(&config, &StaticEnv::new()),
            ManagedIdentity::SystemAssigned
        );
    }

    #[tokio::test]
    async fn test_user_assigned_token_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TOKEN_PATH))
            .and(header("Metadata", "true"))
            .and(query_param("api-version", API_VERSION))
            .and(query_param("resource", "https://management.azure.com/"))
            .and(query_param("client_id", "my-client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "eyJ.mi",
                "client_id": "my-client",
                "expires_on": "1900000000",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = LoginConfig::new(AuthType::Azure);
        config.azure.client_id = Some("my-client".to_string());
        let client = Arc::new(DefaultMetadataClient::new(
            MetadataEndpoints::all(server.uri()),
            Duration::from_secs(2),
        ));

        let credential = chain(&config, &StaticEnv::new(), client)
            .resolve(&LoginContext::new())
            .await
            .unwrap();
        assert_eq!(credential.bearer_token(), "eyJ.mi");
        assert_eq!(credential.access_key_id, "my-client");
        assert_eq!(credential.expiration, parse_expiration("1900000000"));
    }
}
