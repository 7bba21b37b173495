//! Error types for the facade contract

/// Result type for facade calls
pub type JniResult<T> = Result<T, JniError>;

/// Errors surfaced by the object-model facade and the argument reader
#[derive(Debug, Clone, thiserror::Error)]
pub enum JniError {
    /// The embedder supplied no behavior for a resolved method or field
    #[error("no host implementation for {signature}")]
    Unhandled {
        /// Qualified signature of the unhandled member, e.g. `com/foo/Bar->baz(II)I`
        signature: String,
    },

    /// A value did not have the kind the descriptor promised
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected kind name
        expected: String,
        /// Actual kind name
        got: String,
    },

    /// A method or field descriptor failed to parse
    #[error("malformed descriptor {0:?}")]
    BadDescriptor(String),

    /// Free-form facade error
    #[error("{0}")]
    Message(String),
}

impl JniError {
    /// Shorthand for [`JniError::Unhandled`]
    pub fn unhandled(signature: impl Into<String>) -> Self {
        JniError::Unhandled {
            signature: signature.into(),
        }
    }

    /// Shorthand for [`JniError::TypeMismatch`]
    pub fn mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        JniError::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<String> for JniError {
    fn from(s: String) -> Self {
        JniError::Message(s)
    }
}

impl From<&str> for JniError {
    fn from(s: &str) -> Self {
        JniError::Message(s.to_string())
    }
}
