//! Proof-of-identity payloads, one variant per login method.

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::common::{AuthType, Env, LoginConfig, LoginContext};
use crate::credentials;
use crate::error::{LoginError, LoginResult};
use crate::metadata::MetadataClient;

pub mod aws_ec2;
pub mod aws_iam;
pub mod azure;
pub mod gcp;
pub mod pcf;
pub mod sigv4;

pub use gcp::IamCredentialsClient;

/// RFC 3986 unreserved characters pass through, everything else is escaped
pub const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Source of the current time for signatures and expirations
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Identity proof the server verifies against the provider's trust roots
#[derive(Clone, PartialEq, Eq)]
pub enum Attestation {
    /// Signed STS `GetCallerIdentity` request
    IamRequest {
        method: String,
        url: String,
        body: String,
        headers: BTreeMap<String, Vec<String>>,
    },
    Ec2Pkcs7 {
        pkcs7: String,
        nonce: String,
    },
    Ec2Identity {
        identity: String,
        signature: String,
        nonce: String,
    },
    AzureJwt {
        access_token: String,
        vm_name: String,
        vmss_name: String,
        subscription_id: String,
        resource_group: String,
    },
    GcpJwt {
        signed_jwt: String,
    },
    PcfCert {
        instance_id: String,
        org_id: String,
        space_id: String,
        app_id: String,
        ip: String,
        cert_chain: String,
        signature: String,
        signing_time: String,
    },
}

impl Attestation {
    pub fn kind(&self) -> &'static str {
        match self {
            Attestation::IamRequest { .. } => "iam-request",
            Attestation::Ec2Pkcs7 { .. } => "ec2-pkcs7",
            Attestation::Ec2Identity { .. } => "ec2-identity",
            Attestation::AzureJwt { .. } => "azure-jwt",
            Attestation::GcpJwt { .. } => "gcp-jwt",
            Attestation::PcfCert { .. } => "pcf-cert",
        }
    }

    /// Nonce the proof is bound to, for EC2 proofs
    pub fn nonce(&self) -> Option<&str> {
        match self {
            Attestation::Ec2Pkcs7 { nonce, .. } | Attestation::Ec2Identity { nonce, .. } => {
                Some(nonce)
            }
            _ => None,
        }
    }
}

// Tokens and signed requests are bearer material.
impl fmt::Debug for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Attestation");
        debug.field("kind", &self.kind());
        match self {
            Attestation::IamRequest { url, .. } => {
                debug.field("url", url);
            }
            Attestation::AzureJwt { vm_name, .. } => {
                debug.field("vm_name", vm_name);
            }
            Attestation::PcfCert { instance_id, .. } => {
                debug.field("instance_id", instance_id);
            }
            Attestation::Ec2Pkcs7 { .. }
            | Attestation::Ec2Identity { .. }
            | Attestation::GcpJwt { .. } => {}
        }
        debug.finish_non_exhaustive()
    }
}

/// Builds the attestation for the configured login method
pub struct Attestor {
    config: Arc<LoginConfig>,
    env: Arc<dyn Env>,
    metadata: Arc<dyn MetadataClient>,
    iam_credentials: IamCredentialsClient,
    clock: Clock,
}

impl Attestor {
    pub fn new(
        config: Arc<LoginConfig>,
        env: Arc<dyn Env>,
        metadata: Arc<dyn MetadataClient>,
        iam_credentials: IamCredentialsClient,
        clock: Clock,
    ) -> Self {
        Self {
            config,
            env,
            metadata,
            iam_credentials,
            clock,
        }
    }

    /// Gather credentials and metadata, then build the proof. `ec2_nonce` is
    /// required for EC2 logins and ignored otherwise.
    #[instrument(skip(self, ctx, ec2_nonce), fields(auth_type = %self.config.auth_type))]
    pub async fn attest(
        &self,
        ctx: &LoginContext,
        server_address: &str,
        ec2_nonce: Option<&str>,
    ) -> LoginResult<Attestation> {
        let config = &self.config;
        let env = self.env.clone();
        let metadata = self.metadata.clone();

        let attestation = match config.auth_type {
            AuthType::AwsIam => {
                let credential = credentials::aws::chain(&config.aws, env.clone(), metadata)
                    .resolve(ctx)
                    .await?;
                let region = aws_iam::resolve_region(config, env.as_ref());
                aws_iam::build(
                    &credential,
                    region.as_deref(),
                    config.iam_server_id_header.as_deref(),
                    (self.clock)(),
                )?
            }
            AuthType::AwsEc2 => {
                let nonce = ec2_nonce.ok_or_else(|| {
                    LoginError::config_invalid("aws-ec2 login requires a nonce")
                })?;
                aws_ec2::build(metadata.as_ref(), ctx, config.signature_type(), nonce).await?
            }
            AuthType::Azure => {
                let token = credentials::azure::chain(config, env.as_ref(), metadata.clone())
                    .resolve(ctx)
                    .await?;
                azure::build(&token, metadata.as_ref(), ctx).await?
            }
            AuthType::GcpGce => {
                let service_account = config
                    .service_account
                    .as_deref()
                    .filter(|account| !account.is_empty())
                    .unwrap_or("default");
                gcp::build_gce(
                    metadata.as_ref(),
                    ctx,
                    service_account,
                    server_address,
                    &config.role,
                )
                .await?
            }
            AuthType::GcpIam => {
                let token = credentials::gcp::access_token_chain(config, env, metadata.clone())
                    .resolve(ctx)
                    .await?;
                let service_account =
                    credentials::gcp::service_account(config, metadata.as_ref(), ctx).await?;
                gcp::build_iam(
                    &self.iam_credentials,
                    ctx,
                    &token,
                    &service_account,
                    &config.role,
                    config.jwt_ttl(),
                    (self.clock)(),
                )
                .await?
            }
            AuthType::Pcf => pcf::build(ctx, env.as_ref(), &config.role, (self.clock)()).await?,
        };

        debug!("Built {} attestation", attestation.kind());
        Ok(attestation)
    }
}
