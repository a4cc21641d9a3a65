use thiserror::Error;

#[derive(Error, Debug)]
pub enum BriefError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Connector error ({provider}): {message}")]
    Connector { provider: String, message: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation aborted")]
    Aborted,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl BriefError {
    /// True when `err` is (or wraps) an abort of the run's cancellation token.
    pub fn is_aborted(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<BriefError>(), Some(BriefError::Aborted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_detected_through_context() {
        let err = anyhow::Error::from(BriefError::Aborted).context("outline stage");
        assert!(BriefError::is_aborted(&err));
    }

    #[test]
    fn other_errors_are_not_aborted() {
        let err = anyhow::Error::from(BriefError::Validation("bad topic".into()));
        assert!(!BriefError::is_aborted(&err));
    }
}
