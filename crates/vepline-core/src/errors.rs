use std::time::Duration;

/// A submission rejected before it reaches the bus.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload too large: {len} bytes > {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("payload is not valid UTF-8 text")]
    NotText,
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
}

/// Failures of the external annotation call.
/// Classified as retryable, breaker-relevant, or terminal.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum AnnotationError {
    // Retryable
    #[error("transient service error {status}: {body}")]
    Transient { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // Breaker open, no call attempted
    #[error("annotation service unavailable (circuit open)")]
    ServiceUnavailable,

    // Terminal
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("response mapping failed: {0}")]
    Mapping(String),
}

impl AnnotationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Whether this outcome is recorded as a failure by the circuit breaker.
    /// Caller-side mistakes do not say anything about the service's health.
    pub fn counts_toward_breaker(&self) -> bool {
        self.is_retryable()
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::ServiceUnavailable => "service_unavailable",
            Self::MalformedRequest(_) => "malformed_request",
            Self::Mapping(_) => "mapping",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            408 => Self::Timeout(Duration::ZERO),
            429 | 500..=599 => Self::Transient { status, body },
            400..=499 => Self::MalformedRequest(format!("status {status}: {body}")),
            _ => Self::Mapping(format!("unexpected status {status}: {body}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),
    #[error("invalid base64 data: {0}")]
    InvalidData(String),
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(e: serde_json::Error) -> Self {
        EnvelopeError::Malformed(e.to_string())
    }
}
