use thiserror::Error;

/// Problems with the page/field schema itself. These are programmer errors and
/// abort the command.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("page {0} is not defined in the form schema")]
    UnknownPage(u32),

    #[error("page {page} appears after page {previous}; pages must be unique and increasing")]
    PageOrder { previous: u32, page: u32 },

    #[error("page {page} lists field {field:?} more than once")]
    DuplicateField { page: u32, field: String },

    #[error("page {0} contains an empty field name")]
    EmptyField(u32),

    #[error("form schema defines no pages")]
    NoPages,

    #[error("reference field {0:?} is not defined on any page")]
    MissingReferenceField(String),

    #[error("invalid form schema document: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Failures talking to a vision model backend.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model endpoint {endpoint} is unavailable: {message}")]
    Unavailable { endpoint: String, message: String },

    #[error("model endpoint {endpoint} did not answer within {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },

    #[error("model endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("hosted backend requires an API key (set GEMINI_API_KEY or --api-key)")]
    MissingApiKey,

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl ModelError {
    /// Connection failures, timeouts, throttling and server-side errors may
    /// succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedResponse(_) | Self::MissingApiKey | Self::Client(_) => false,
        }
    }
}

/// Failures shaping or writing an extracted record.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("record has no value for reference field {0:?}")]
    MissingReference(String),

    #[error("database write failed: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("export i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_retryable_statuses() {
        let unavailable = ModelError::Unavailable {
            endpoint: "http://localhost:11434".to_string(),
            message: "refused".to_string(),
        };
        assert!(unavailable.is_transient());
        assert!(
            ModelError::Status {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            ModelError::Status {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ModelError::Status {
                status: 400,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!ModelError::MissingApiKey.is_transient());
    }
}
