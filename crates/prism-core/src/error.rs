//! Failure taxonomy for the analysis pipeline
//!
//! `Unauthorized` is decided before any ledger write. `FetchFailed` and
//! `PersistFailed` are recovered locally by falling back to the
//! unresolved source URL. The remaining kinds are terminal: they are
//! recorded in the ledger and a request is either fully successful or
//! fully failed, never a mix.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("missing or invalid credential")]
    Unauthorized,
    #[error("failed to fetch source image: {0}")]
    FetchFailed(String),
    #[error("failed to persist source image: {0}")]
    PersistFailed(String),
    #[error("vision model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("vision model returned an empty narrative")]
    EmptyModelOutput,
    #[error("sentence scoring failed: {0}")]
    ScoringFailed(String),
    #[error("request not found")]
    NotFound,
}

impl AnalysisError {
    /// Stable kind string carried in error bodies and ledger records.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Unauthorized => "unauthorized",
            AnalysisError::FetchFailed(_) => "fetch_failed",
            AnalysisError::PersistFailed(_) => "persist_failed",
            AnalysisError::ModelUnavailable(_) => "model_unavailable",
            AnalysisError::EmptyModelOutput => "empty_model_output",
            AnalysisError::ScoringFailed(_) => "scoring_failed",
            AnalysisError::NotFound => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_distinct() {
        let errors = [
            AnalysisError::Unauthorized,
            AnalysisError::FetchFailed("x".into()),
            AnalysisError::PersistFailed("x".into()),
            AnalysisError::ModelUnavailable("x".into()),
            AnalysisError::EmptyModelOutput,
            AnalysisError::ScoringFailed("x".into()),
            AnalysisError::NotFound,
        ];

        let mut kinds: Vec<&str> = errors.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_messages_carry_detail() {
        let err = AnalysisError::ModelUnavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
