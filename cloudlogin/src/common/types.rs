use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Session token issued by the server after a successful login
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub client_token: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub accessor: String,

    /// Lease duration in seconds
    #[serde(default, deserialize_with = "null_as_default")]
    pub lease_duration: u64,

    #[serde(default, deserialize_with = "null_as_default")]
    pub renewable: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub policies: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub token_policies: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub entity_id: String,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("client_token", &"** redacted **")
            .field("accessor", &self.accessor)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("policies", &self.policies)
            .field("token_policies", &self.token_policies)
            .field("metadata", &self.metadata)
            .field("entity_id", &self.entity_id)
            .finish()
    }
}

// The server sends `null` for empty lists and maps.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Response envelope returned by the server's login endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub request_id: String,

    #[serde(default)]
    pub auth: Option<Token>,

    #[serde(default)]
    pub warnings: Option<Vec<String>>,
}

/// Error envelope returned by the server for non-2xx responses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<String>,
}
