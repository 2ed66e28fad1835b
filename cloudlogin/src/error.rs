use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while logging in with a cloud identity
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("config invalid: {message}")]
    ConfigInvalid { message: String },

    #[error("{step}: no credential available: {message}")]
    CredentialUnavailable {
        step: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error(
        "{step}: metadata service unavailable{}: {description}",
        status_suffix(.status, .code)
    )]
    MetadataUnavailable {
        step: String,
        status: Option<u16>,
        code: Option<String>,
        description: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{step}: {message}")]
    AttestationFailed {
        step: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("login rejected (status {status}): {message}")]
    LoginRejected {
        status: u16,
        message: String,
        errors: Vec<String>,
    },

    #[error("login server error (status {status}): {message}")]
    LoginServerError { status: u16, message: String },

    #[error("{step}: transient login error: {source}")]
    LoginTransientError {
        step: String,
        #[source]
        source: BoxError,
    },

    #[error("another login is already in progress on this auth method")]
    LoginBusy,
}

fn status_suffix(status: &Option<u16>, code: &Option<String>) -> String {
    match (status, code) {
        (Some(status), Some(code)) => format!(" (status {}, code {})", status, code),
        (Some(status), None) => format!(" (status {})", status),
        (None, Some(code)) => format!(" (code {})", code),
        (None, None) => String::new(),
    }
}

impl LoginError {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn credential_unavailable(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CredentialUnavailable {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn metadata_unavailable(
        step: impl Into<String>,
        status: Option<u16>,
        code: Option<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::MetadataUnavailable {
            step: step.into(),
            status,
            code,
            description: description.into(),
            source: None,
        }
    }

    pub fn metadata_transport(step: impl Into<String>, source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::MetadataUnavailable {
            step: step.into(),
            status: None,
            code: None,
            description: source.to_string(),
            source: Some(source),
        }
    }

    pub fn attestation(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AttestationFailed {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn attestation_caused(
        step: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::AttestationFailed {
            step: step.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn rejected(status: u16, errors: Vec<String>) -> Self {
        Self::LoginRejected {
            status,
            message: errors.join("\n"),
            errors,
        }
    }

    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::LoginServerError {
            status,
            message: message.into(),
        }
    }

    pub fn transient(step: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::LoginTransientError {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Whether the caller may retry the same login later without changing
    /// its configuration or environment.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MetadataUnavailable { .. }
                | Self::LoginTransientError { .. }
                | Self::LoginServerError { .. }
                | Self::LoginBusy
        )
    }

    /// Whether this error was produced by context cancellation or deadline.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::LoginTransientError { source, .. } => source.is::<Interrupted>(),
            _ => false,
        }
    }
}

/// Reason a login context stopped accepting work
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interrupted> for LoginError {
    fn from(cause: Interrupted) -> Self {
        LoginError::transient("context", cause)
    }
}

pub type LoginResult<T> = Result<T, LoginError>;
