use crate::compression::backend::BackendKind;

/// Fatal conversion failures that callers may want to tell apart.
///
/// I/O and builder failures travel as `anyhow::Error` with context attached;
/// these variants stay reachable through `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("invalid options: {0}")]
    Validation(String),

    #[error("zstd implementation {kind} forced but unavailable: {reason}")]
    UnavailableBackend { kind: BackendKind, reason: &'static str },

    #[error("content integrity violation in layer {layer}: expected diffID {expected}, found {actual}")]
    ContentIntegrity {
        layer: String,
        expected: String,
        actual: String,
    },

    #[error("{tool} failed: {message}")]
    Builder { tool: String, message: String },

    #[error("conversion cancelled")]
    Cancelled,
}

impl ConvertError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Finds the typed error inside an `anyhow` chain, if there is one.
pub fn find_convert_error(error: &anyhow::Error) -> Option<&ConvertError> {
    error.chain().find_map(|cause| cause.downcast_ref::<ConvertError>())
}
