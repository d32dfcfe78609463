use kptcond_core::{CoreError, Reference};

/// Engine errors. Configuration errors abort before any mutation; the others
/// are scoped to a single for-Reference and recorded on its condition.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("{stage}: callback failed for {reference}: {message}")]
    Callback { stage: &'static str, reference: Reference, message: String },
    #[error("mandatory Kptfile is missing from the package")]
    MissingKptfile,
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl SdkError {
    pub(crate) fn invalid_ref(msg: impl Into<String>) -> Self { Self::InvalidReference(msg.into()) }
}

/// Join accumulated per-scope errors into one condition message.
pub(crate) fn join_errors(errs: &[SdkError]) -> Option<String> {
    if errs.is_empty() {
        return None;
    }
    Some(errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))
}
