use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LoginError, LoginResult};

/// Identity provider used to log in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    AwsIam,
    AwsEc2,
    Azure,
    GcpGce,
    GcpIam,
    Pcf,
}

impl AuthType {
    pub const ALL: [AuthType; 6] = [
        AuthType::AwsIam,
        AuthType::AwsEc2,
        AuthType::Azure,
        AuthType::GcpGce,
        AuthType::GcpIam,
        AuthType::Pcf,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::AwsIam => "aws-iam",
            AuthType::AwsEc2 => "aws-ec2",
            AuthType::Azure => "azure",
            AuthType::GcpGce => "gcp-gce",
            AuthType::GcpIam => "gcp-iam",
            AuthType::Pcf => "pcf",
        }
    }

    /// Mount path the server uses for this backend unless configured otherwise
    pub fn default_mount_path(&self) -> &'static str {
        match self {
            AuthType::AwsIam | AuthType::AwsEc2 => "aws",
            AuthType::Azure => "azure",
            AuthType::GcpGce | AuthType::GcpIam => "gcp",
            AuthType::Pcf => "pcf",
        }
    }

    /// Whether the server can infer the role from the attestation
    pub fn role_optional(&self) -> bool {
        matches!(self, AuthType::AwsIam | AuthType::AwsEc2)
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = LoginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "aws-iam" | "iam" => Ok(AuthType::AwsIam),
            "aws-ec2" | "ec2" => Ok(AuthType::AwsEc2),
            "azure" => Ok(AuthType::Azure),
            "gcp-gce" | "gce" => Ok(AuthType::GcpGce),
            "gcp-iam" => Ok(AuthType::GcpIam),
            "pcf" | "cf" => Ok(AuthType::Pcf),
            _ => Err(LoginError::config_invalid(format!(
                "unknown auth type {:?}",
                s
            ))),
        }
    }
}

/// EC2 instance identity proof to submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureType {
    #[default]
    Pkcs7,
    Identity,
}

impl FromStr for SignatureType {
    type Err = LoginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pkcs7" => Ok(SignatureType::Pkcs7),
            "identity" => Ok(SignatureType::Identity),
            _ => Err(LoginError::config_invalid(format!(
                "unknown signature type {:?}",
                s
            ))),
        }
    }
}

/// Per-login configuration, read-only while a login runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    /// Identity provider
    pub auth_type: AuthType,

    /// Server-side role to log in against; empty lets the server infer it (AWS only)
    #[serde(default)]
    pub role: String,

    /// Mount path of the auth backend; defaults per provider
    #[serde(default)]
    pub mount_path: Option<String>,

    /// STS signing region (AWS IAM)
    #[serde(default)]
    pub region: Option<String>,

    /// Token audience resource (Azure)
    #[serde(default)]
    pub resource: Option<String>,

    /// Instance identity proof type (AWS EC2)
    #[serde(default)]
    pub signature_type: Option<SignatureType>,

    /// Reauthentication nonce (AWS EC2)
    #[serde(default)]
    pub nonce: Option<String>,

    /// Value for the X-Vault-AWS-IAM-Server-ID header (AWS IAM)
    #[serde(default)]
    pub iam_server_id_header: Option<String>,

    /// Lifetime of the signed JWT in minutes (GCP IAM)
    #[serde(default)]
    pub jwt_ttl_minutes: Option<u32>,

    /// Service account name or email (GCP)
    #[serde(default)]
    pub service_account: Option<String>,

    /// Timeout for each metadata request or RPC, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// AWS credential sources
    #[serde(default)]
    pub aws: AwsCredentialsConfig,

    /// Azure managed identity selection
    #[serde(default)]
    pub azure: AzureIdentityConfig,

    /// OAuth access token for the IAM Credentials API (GCP IAM)
    #[serde(default)]
    pub gcp_access_token: Option<String>,

    /// Alibaba Cloud credential sources
    #[serde(default)]
    pub alicloud: KeyPairConfig,

    /// Tencent Cloud credential sources
    #[serde(default)]
    pub tencent: KeyPairConfig,

    /// Yandex Cloud credential sources
    #[serde(default)]
    pub yandex: YandexConfig,
}

/// Static AWS credential parameters
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AwsCredentialsConfig {
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub session_token: Option<String>,

    /// Consult the shared credentials file
    #[serde(default)]
    pub use_shared_file: bool,

    /// Shared credentials file; AWS_SHARED_CREDENTIALS_FILE wins when set
    #[serde(default)]
    pub shared_credentials_file: Option<PathBuf>,

    /// Profile inside the shared credentials file
    #[serde(default)]
    pub profile: Option<String>,
}

impl fmt::Debug for AwsCredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentialsConfig")
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "** redacted **"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .field("use_shared_file", &self.use_shared_file)
            .field("shared_credentials_file", &self.shared_credentials_file)
            .field("profile", &self.profile)
            .finish()
    }
}

/// Static key pair plus the instance role to fall back to
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct KeyPairConfig {
    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,

    #[serde(default)]
    pub session_token: Option<String>,

    /// Instance role to read from metadata; listed when unset
    #[serde(default)]
    pub metadata_role: Option<String>,
}

impl fmt::Debug for KeyPairConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairConfig")
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "** redacted **"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .field("metadata_role", &self.metadata_role)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct YandexConfig {
    #[serde(default)]
    pub oauth_token: Option<String>,

    /// Authorized key JSON file of a service account
    #[serde(default)]
    pub service_account_key_file: Option<PathBuf>,

    #[serde(default)]
    pub kms_key_id: Option<String>,
}

impl fmt::Debug for YandexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YandexConfig")
            .field(
                "oauth_token",
                &self.oauth_token.as_ref().map(|_| "** redacted **"),
            )
            .field("service_account_key_file", &self.service_account_key_file)
            .field("kms_key_id", &self.kms_key_id)
            .finish()
    }
}

/// Which managed identity to request a token for; system-assigned when all are empty
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureIdentityConfig {
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub object_id: Option<String>,

    #[serde(default)]
    pub mi_res_id: Option<String>,
}

impl LoginConfig {
    pub fn new(auth_type: AuthType) -> Self {
        Self {
            auth_type,
            role: String::new(),
            mount_path: None,
            region: None,
            resource: None,
            signature_type: None,
            nonce: None,
            iam_server_id_header: None,
            jwt_ttl_minutes: None,
            service_account: None,
            timeout_ms: default_timeout_ms(),
            aws: AwsCredentialsConfig::default(),
            azure: AzureIdentityConfig::default(),
            gcp_access_token: None,
            alicloud: KeyPairConfig::default(),
            tencent: KeyPairConfig::default(),
            yandex: YandexConfig::default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> LoginResult<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| LoginError::config_invalid(format!("failed to parse config: {}", e)))
    }

    pub fn from_file(path: &Path) -> LoginResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoginError::config_invalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn mount_path(&self) -> &str {
        self.mount_path
            .as_deref()
            .unwrap_or_else(|| self.auth_type.default_mount_path())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn signature_type(&self) -> SignatureType {
        self.signature_type.unwrap_or_default()
    }

    pub fn resource(&self) -> &str {
        self.resource.as_deref().unwrap_or(DEFAULT_AZURE_RESOURCE)
    }

    pub fn jwt_ttl(&self) -> Duration {
        let minutes = match self.jwt_ttl_minutes {
            None | Some(0) => DEFAULT_JWT_TTL_MINUTES,
            Some(minutes) => minutes,
        };
        Duration::from_secs(u64::from(minutes) * 60)
    }

    /// Reject option combinations that cannot work for the chosen provider.
    pub fn validate(&self) -> LoginResult<()> {
        let auth_type = self.auth_type;

        if let Some(mount_path) = &self.mount_path {
            let trimmed = mount_path.trim_matches('/');
            if trimmed.is_empty() {
                return Err(LoginError::config_invalid("mount path must not be empty"));
            }
            if trimmed.split('/').any(|segment| segment.is_empty() || segment == "..") {
                return Err(LoginError::config_invalid(format!(
                    "invalid mount path {:?}",
                    mount_path
                )));
            }
        }

        if self.role.trim().is_empty() && !auth_type.role_optional() {
            return Err(LoginError::config_invalid(format!(
                "role name is required for {} login",
                auth_type
            )));
        }

        if self.timeout_ms == 0 {
            return Err(LoginError::config_invalid("timeout must be at least one millisecond"));
        }

        let only_for = |set: bool, option: &str, allowed: &[AuthType]| -> LoginResult<()> {
            if set && !allowed.contains(&auth_type) {
                return Err(LoginError::config_invalid(format!(
                    "option {} does not apply to {} login",
                    option, auth_type
                )));
            }
            Ok(())
        };

        only_for(self.region.is_some(), "region", &[AuthType::AwsIam])?;
        only_for(
            self.iam_server_id_header.is_some(),
            "iam_server_id_header",
            &[AuthType::AwsIam],
        )?;
        only_for(
            self.signature_type.is_some(),
            "signature_type",
            &[AuthType::AwsEc2],
        )?;
        only_for(self.nonce.is_some(), "nonce", &[AuthType::AwsEc2])?;
        only_for(self.resource.is_some(), "resource", &[AuthType::Azure])?;
        only_for(
            self.jwt_ttl_minutes.is_some(),
            "jwt_ttl_minutes",
            &[AuthType::GcpIam],
        )?;
        only_for(
            self.gcp_access_token.is_some(),
            "gcp_access_token",
            &[AuthType::GcpIam],
        )?;
        only_for(
            self.service_account.is_some(),
            "service_account",
            &[AuthType::GcpGce, AuthType::GcpIam],
        )?;

        if let Some(ttl) = self.jwt_ttl_minutes {
            if ttl > MAX_JWT_TTL_MINUTES {
                return Err(LoginError::config_invalid(format!(
                    "jwt ttl of {} minutes exceeds the maximum of {}",
                    ttl, MAX_JWT_TTL_MINUTES
                )));
            }
        }

        if let Some(nonce) = &self.nonce {
            if nonce.trim().is_empty() {
                return Err(LoginError::config_invalid("nonce must not be empty"));
            }
        }

        if let Some(header) = &self.iam_server_id_header {
            if header.is_empty() || header.chars().any(|c| c.is_control()) {
                return Err(LoginError::config_invalid(
                    "iam server id header value must be non-empty printable text",
                ));
            }
        }

        let key_pairs = [
            ("AWS", &self.aws.access_key_id, &self.aws.secret_access_key),
            (
                "Alibaba Cloud",
                &self.alicloud.access_key_id,
                &self.alicloud.secret_access_key,
            ),
            (
                "Tencent Cloud",
                &self.tencent.access_key_id,
                &self.tencent.secret_access_key,
            ),
        ];
        for (provider, key_id, secret) in key_pairs {
            if key_id.is_some() != secret.is_some() {
                return Err(LoginError::config_invalid(format!(
                    "static {} credentials need both access_key_id and secret_access_key",
                    provider
                )));
            }
        }

        if self.yandex.oauth_token.is_some() && self.yandex.service_account_key_file.is_some() {
            return Err(LoginError::config_invalid(
                "only one of yandex oauth_token or service_account_key_file may be set",
            ));
        }

        let azure_selectors = [
            self.azure.client_id.is_some(),
            self.azure.object_id.is_some(),
            self.azure.mi_res_id.is_some(),
        ];
        if azure_selectors.iter().filter(|set| **set).count() > 1 {
            return Err(LoginError::config_invalid(
                "only one of azure client_id, object_id or mi_res_id may be set",
            ));
        }

        Ok(())
    }
}

pub const DEFAULT_AZURE_RESOURCE: &str = "https://management.azure.com/";
pub const DEFAULT_JWT_TTL_MINUTES: u32 = 15;
pub const MAX_JWT_TTL_MINUTES: u32 = 60;

// Default value functions
fn default_timeout_ms() -> u64 {
    10_000
}
