use thiserror::Error;

use crate::wave::Stage;

/// Errors surfaced by the correction engine.
///
/// Race conditions (caret moved into the Active Region, text changed under a
/// stream) are not errors: they are reported as `false`/empty results and
/// logged, because they are expected during normal typing.
#[derive(Debug, Error)]
pub enum CorrectionError {
    /// No generation adapter has been configured for the session.
    #[error("no generation adapter configured, corrections unavailable")]
    AdapterMissing,

    /// The adapter exists but failed to initialize or died.
    #[error("generation adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The adapter failed while producing a stream.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The stream was cancelled before it completed.
    #[error("generation cancelled")]
    Cancelled,

    #[error("{stage} stage timed out after {ms}ms")]
    Timeout { stage: Stage, ms: u64 },

    #[error("invalid setting '{name}': {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CorrectionError {
    /// Whether this error means the session cannot correct at all, as opposed
    /// to a single stage or tick failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CorrectionError::AdapterMissing | CorrectionError::AdapterUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CorrectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_errors_are_classified() {
        assert!(CorrectionError::AdapterMissing.is_unavailable());
        assert!(CorrectionError::AdapterUnavailable("gone".into()).is_unavailable());
        assert!(!CorrectionError::Generation("boom".into()).is_unavailable());
        assert!(!CorrectionError::Cancelled.is_unavailable());
    }

    #[test]
    fn timeout_message_names_stage() {
        let err = CorrectionError::Timeout {
            stage: Stage::Context,
            ms: 250,
        };
        assert_eq!(err.to_string(), "context stage timed out after 250ms");
    }
}
