use async_trait::async_trait;
use chrono::{TimeZone, Utc};
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

const STEP: &str = "credentials/tencent";
const CAM_CREDENTIALS_PATH: &str = "/latest/meta-data/cam/security-credentials/";

pub const ENV_KEYS: EnvKeys = EnvKeys {
    access_key_id: env::TENCENTCLOUD_SECRET_ID,
    secret_access_key: env::TENCENTCLOUD_SECRET_KEY,
    session_token: env::TENCENTCLOUD_SECURITY_TOKEN,
};

/// Static config, then environment, then the CVM CAM role
pub fn chain(
    config: &KeyPairConfig,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
) -> CredentialChain {
    CredentialChain::new("tencent")
        .step(StaticStep::new(
            STEP,
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            config.session_token.clone(),
        ))
        .step(RegionalEnvironmentStep {
            inner: EnvironmentStep::new(STEP, ENV_KEYS, env.clone()),
            env,
        })
        .step(CamRoleStep {
            role: config.metadata_role.clone(),
            client: metadata,
        })
}

/// Environment key pair tagged with `TENCENTCLOUD_REGION`
pub struct RegionalEnvironmentStep {
    inner: EnvironmentStep,
    env: Arc<dyn Env>,
}

#[async_trait]
impl CredentialStep for RegionalEnvironmentStep {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn resolve(&self, ctx: &LoginContext) -> LoginResult<Option<Credential>> {
        let credential = self.inner.resolve(ctx).await?;
        Ok(credential.map(|credential| match self.env.non_empty(env::TENCENTCLOUD_REGION) {
            Some(region) => credential.with_label("region", region),
            None => credential,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct CamCredentials {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "TmpSecretId", default)]
    tmp_secret_id: String,
    #[serde(rename = "TmpSecretKey", default)]
    tmp_secret_key: String,
    #[serde(rename = "Token", default)]
    token: Option<String>,
    #[serde(rename = "ExpiredTime", default)]
    expired_time: Option<i64>,
}

/// CAM role credentials from the CVM metadata service
pub struct CamRoleStep {
    role: Option<String>,
    client: Arc<dyn MetadataClient>,
}

#[async_trait]
impl CredentialStep for CamRoleStep {
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
                        MetadataRequest::get(MetadataProvider::Tencent, CAM_CREDENTIALS_PATH),
                    )
                    .await?
                    .text("metadata/tencent")?;
                match first_listed_role(&listing) {
                    Some(role) => role,
                    None => return Ok(None),
                }
            }
        };
        debug!("Reading credentials of CAM role {}", role);

        let credentials: CamCredentials = self
            .client
            .send(
                ctx,
                MetadataRequest::get(
                    MetadataProvider::Tencent,
                    format!("{}{}", CAM_CREDENTIALS_PATH, role),
                ),
            )
            .await?
            .json("metadata/tencent")?;

        if let Some(code) = credentials.code.filter(|code| code != "Success") {
            return Err(LoginError::metadata_unavailable(
                "metadata/tencent",
                None,
                Some(code),
                format!("CAM role {} has no usable credentials", role),
            ));
        }

        let expiration = credentials
            .expired_time
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        Ok(Some(
            Credential::new(
                credentials.tmp_secret_id,
                credentials.tmp_secret_key,
                "instance-metadata",
            )
            .with_session_token(credentials.token)
            .with_expiration(expiration)
            .with_label("role", role),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StaticEnv;
    use crate::metadata::{DefaultMetadataClient, MetadataEndpoints};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_environment_carries_region() {
        let env = Arc::new(
            StaticEnv::new()
                .with(env::TENCENTCLOUD_SECRET_ID, "AKIDtc")
                .with(env::TENCENTCLOUD_SECRET_KEY, "tc-secret")
                .with(env::TENCENTCLOUD_REGION, "ap-guangzhou"),
        );
        let metadata = Arc::new(DefaultMetadataClient::new(
            MetadataEndpoints::all("http://127.0.0.1:9"),
            Duration::from_millis(200),
        ));

        let credential = chain(&KeyPairConfig::default(), env, metadata)
            .resolve(&LoginContext::new())
            .await
            .unwrap();
        assert_eq!(credential.access_key_id, "AKIDtc");
        assert_eq!(credential.label("region"), Some("ap-guangzhou"));
        assert_eq!(credential.provider, "environment");
    }

    #[tokio::test]
    async fn test_cam_role_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/cam/security-credentials/cvm-role"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Code": "Success",
                "TmpSecretId": "AKIDcam",
                "TmpSecretKey": "cam-secret",
                "Token": "cam-token",
                "ExpiredTime": 1900000000
            })))
            .mount(&server)
            .await;

        let config = KeyPairConfig {
            metadata_role: Some("cvm-role".to_string()),
            ..Default::default()
        };
        let client = Arc::new(DefaultMetadataClient::new(
            MetadataEndpoints::all(server.uri()),
            Duration::from_secs(2),
        ));
        let credential = chain(&config, Arc::new(StaticEnv::new()), client)
            .resolve(&LoginContext::new())
            .await
            .unwrap();
        assert_eq!(credential.access_key_id, "AKIDcam");
        assert_eq!(credential.session_token.as_deref(), Some("cam-token"));
        assert_eq!(
            credential.expiration,
            Utc.timestamp_opt(1_900_000_000, 0).single()
        );
    }
}
