use std::collections::HashMap;
use std::fmt;

/// Read access to environment variables, injected so logins are deterministic in tests
pub trait Env: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Like [`Env::var`] but treats empty values as unset
    fn non_empty(&self, key: &str) -> Option<String> {
        self.var(key).filter(|value| !value.trim().is_empty())
    }
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Env for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed set of variables
#[derive(Clone, Default)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl<K, V> FromIterator<(K, V)> for StaticEnv
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Env for StaticEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

// Values may be secrets; only the keys are shown.
impl fmt::Debug for StaticEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.vars.keys().collect();
        keys.sort();
        f.debug_struct("StaticEnv").field("keys", &keys).finish()
    }
}

// Well-known variable names
pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const AWS_SHARED_CREDENTIALS_FILE: &str = "AWS_SHARED_CREDENTIALS_FILE";
pub const AWS_PROFILE: &str = "AWS_PROFILE";
pub const AWS_REGION: &str = "AWS_REGION";
pub const AWS_EC2_METADATA_SERVICE_ENDPOINT: &str = "AWS_EC2_METADATA_SERVICE_ENDPOINT";
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const GCE_METADATA_HOST: &str = "GCE_METADATA_HOST";
pub const GOOGLE_OAUTH_ACCESS_TOKEN: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const ALICLOUD_ACCESS_KEY: &str = "ALICLOUD_ACCESS_KEY";
pub const ALICLOUD_SECRET_KEY: &str = "ALICLOUD_SECRET_KEY";
pub const ALICLOUD_SECURITY_TOKEN: &str = "ALICLOUD_SECURITY_TOKEN";
pub const TENCENTCLOUD_SECRET_ID: &str = "TENCENTCLOUD_SECRET_ID";
pub const TENCENTCLOUD_SECRET_KEY: &str = "TENCENTCLOUD_SECRET_KEY";
pub const TENCENTCLOUD_SECURITY_TOKEN: &str = "TENCENTCLOUD_SECURITY_TOKEN";
pub const TENCENTCLOUD_REGION: &str = "TENCENTCLOUD_REGION";
pub const YANDEXCLOUD_OAUTH_TOKEN: &str = "YANDEXCLOUD_OAUTH_TOKEN";
pub const YANDEXCLOUD_SERVICE_ACCOUNT_KEY_FILE: &str = "YANDEXCLOUD_SERVICE_ACCOUNT_KEY_FILE";
pub const YANDEXCLOUD_KMS_KEY_ID: &str = "YANDEXCLOUD_KMS_KEY_ID";
pub const CF_INSTANCE_CERT: &str = "CF_INSTANCE_CERT";
pub const CF_INSTANCE_KEY: &str = "CF_INSTANCE_KEY";
