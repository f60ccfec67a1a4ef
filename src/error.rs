use thiserror::Error;

/// Every failure an entry point can report.
///
/// None of these crash the process: each is recorded as the last error and
/// surfaced to the caller as a failure indicator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("bridge not initialized")]
    NotInitialized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid argument for {method}: {reason}")]
    InvalidArgument { method: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Raised by the embedded runtime or the vendor module; message kept verbatim.
    #[error("{0}")]
    ForeignRuntime(String),

    #[error("reentrant call into the bridge from inside a foreign-runtime call")]
    Reentrant,

    /// A panic caught at the C boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable non-zero status code reported across the C ABI.
    pub fn code(&self) -> i32 {
        match self {
            Self::ForeignRuntime(_) => -1,
            Self::NotInitialized => -2,
            Self::InvalidRequest(_) => -3,
            Self::UnknownMethod(_) => -4,
            Self::InvalidArgument { .. } => -5,
            Self::Serialization(_) => -6,
            Self::Reentrant => -7,
            Self::Internal(_) => -8,
        }
    }

    pub(crate) fn invalid_argument(method: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result of an idempotent lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The transition ran.
    Performed,
    /// The bridge was already in the requested state; nothing happened.
    AlreadyHandled,
}
