//! Error types for the Apicurio Registry operator
//!
//! Every error carries an [`ErrorClass`]. The dispatcher is the only place
//! that turns a class into a retry decision; nothing below it retries.

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The registry spec is malformed or contradictory
    #[error("Validation error: {0}")]
    Validation(String),

    /// A resource with the desired name exists but is not owned by this registry
    #[error("Ownership conflict: {kind}/{name} is not controlled by this registry")]
    Ownership { kind: String, name: String },

    /// The API server refused the request (4xx other than 404/409/429)
    #[error("Request rejected by API server ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// Version token mismatch on update
    #[error("Conflict on {0}: object was modified concurrently")]
    Conflict(String),

    /// Timeouts, connection resets, 5xx and throttling
    #[error("Transient API error: {0}")]
    Transient(String),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// The operator cannot start (e.g. CRD not installed)
    #[error("Fatal startup error: {0}")]
    FatalStartup(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Retry classification of an [`OperatorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Needs a spec or environment change; surfaced as a condition
    Permanent,
    /// Lost an optimistic-concurrency race; retry on next dequeue
    Conflict,
    /// Retry with exponential backoff
    Transient,
    /// Object already gone
    NotFound,
    /// Operator must not serve reconciles
    Fatal,
}

impl OperatorError {
    /// Classify this error for the dispatcher
    pub fn class(&self) -> ErrorClass {
        match self {
            OperatorError::Validation(_)
            | OperatorError::Ownership { .. }
            | OperatorError::Rejected { .. }
            | OperatorError::Serialization(_)
            | OperatorError::Yaml(_) => ErrorClass::Permanent,
            OperatorError::Conflict(_) => ErrorClass::Conflict,
            OperatorError::Transient(_) => ErrorClass::Transient,
            OperatorError::NotFound { .. } => ErrorClass::NotFound,
            OperatorError::FatalStartup(_) => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable without user intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict | ErrorClass::Transient)
    }

    /// Short machine-readable reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::Validation(_) => "InvalidSpec",
            OperatorError::Ownership { .. } => "OwnershipConflict",
            OperatorError::Rejected { .. } => "ApiRejected",
            OperatorError::Conflict(_) => "Conflict",
            OperatorError::Transient(_) => "TransientError",
            OperatorError::NotFound { .. } => "NotFound",
            OperatorError::FatalStartup(_) => "FatalStartup",
            OperatorError::Serialization(_) | OperatorError::Yaml(_) => "SerializationFailed",
        }
    }

    pub(crate) fn not_found(kind: &str, namespace: &str, name: &str) -> Self {
        OperatorError::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Map a kube error, attaching the object it concerned
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(ae) if ae.code == 409 => {
                OperatorError::Conflict(format!("{}/{}/{}", kind, namespace, name))
            }
            other => other.into(),
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => OperatorError::NotFound {
                    kind: String::new(),
                    name: String::new(),
                    namespace: String::new(),
                },
                409 => OperatorError::Conflict(ae.message),
                429 => OperatorError::Transient(ae.message),
                code if code >= 500 => OperatorError::Transient(ae.message),
                code => OperatorError::Rejected {
                    code,
                    message: ae.message,
                },
            },
            kube::Error::SerdeError(e) => OperatorError::Serialization(e),
            other => OperatorError::Transient(other.to_string()),
        }
    }
}
