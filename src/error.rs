use thiserror::Error;

/// Convenience type alias for Results with CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for Meridian Core
///
/// A closed taxonomy shared by every component boundary. The HTTP surface
/// performs the final mapping to status codes; nothing below it formats
/// errors for clients.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed on `{field}`: {message}")]
    Validation { field: String, message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: missing permission `{permission}`")]
    Forbidden { permission: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded on `{dimension}`")]
    QuotaExceeded {
        dimension: String,
        retry_after_secs: u64,
    },

    #[error("rate limited")]
    RateLimited,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider transport error: {0}")]
    ProviderTransport(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn forbidden(permission: impl Into<String>) -> Self {
        CoreError::Forbidden {
            permission: permission.into(),
        }
    }

    pub fn not_found(subject: impl Into<String>) -> Self {
        CoreError::NotFound(subject.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CoreError::Conflict(message.into())
    }

    pub fn quota(dimension: impl Into<String>, retry_after_secs: u64) -> Self {
        CoreError::QuotaExceeded {
            dimension: dimension.into(),
            retry_after_secs,
        }
    }
}
