//! Verifier capability and the request/identity/error types it speaks.
//!
//! Everything here is plain data so that it can be handed to a worker thread
//! or serialized across the worker process pipe.

use serde::{Deserialize, Serialize};

/// One verification request: the assertion plus its call options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub assertion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Free-form keyword options forwarded to the verifier untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl VerifyRequest {
    pub fn new(assertion: impl Into<String>) -> Self {
        Self {
            assertion: assertion.into(),
            audience: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// A successfully verified principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub audience: String,
    pub issuer: String,
    /// Assertion expiry in milliseconds since the UNIX epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

/// Why a single assertion failed to verify.
///
/// Serializable so a worker process can report it back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum VerificationError {
    #[error("malformed assertion: {0}")]
    Malformed(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("assertion expired: {0}")]
    Expired(String),

    #[error("audience mismatch: {0}")]
    AudienceMismatch(String),

    /// The issuer is not trusted for the asserted identity.
    #[error("trust error: {0}")]
    Trust(String),

    /// A trust document could not be retrieved.
    #[error("connection error: {0}")]
    Connection(String),

    #[error("verification failed: {0}")]
    Other(String),
}

/// Result of running one verification job.
pub type Outcome = Result<Identity, VerificationError>;

/// The verification capability handed to every worker.
///
/// Implementations must not hold anything that cannot live on another
/// thread; process-isolated workers build their own instance.
pub trait Verifier: Send + Sync + 'static {
    fn verify(&self, request: &VerifyRequest) -> Outcome;
}

impl<F> Verifier for F
where
    F: Fn(&VerifyRequest) -> Outcome + Send + Sync + 'static,
{
    fn verify(&self, request: &VerifyRequest) -> Outcome {
        self(request)
    }
}
