use serde::{Deserialize, Serialize};
use thiserror::Error;
use veil_fhe::FheError;

/// Failures surfaced by the search core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{0}")]
    KeyMissing(String),

    #[error("{0}")]
    Compilation(String),

    #[error("{0}")]
    Evaluation(String),

    #[error("{0}")]
    Decryption(String),

    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Wire name of each failure, carried in tagged API results.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DimensionMismatch,
    KeyMissingError,
    CompilationError,
    EvaluationError,
    DecryptionError,
    ConfigMismatch,
    StorageError,
    InternalError,
}

impl ErrorKind {
    /// Caller errors are reported immediately and never retried.
    pub fn is_caller_error(self) -> bool {
        matches!(self, ErrorKind::DimensionMismatch | ErrorKind::ConfigMismatch)
    }
}

impl SearchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SearchError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            SearchError::KeyMissing(_) => ErrorKind::KeyMissingError,
            SearchError::Compilation(_) => ErrorKind::CompilationError,
            SearchError::Evaluation(_) => ErrorKind::EvaluationError,
            SearchError::Decryption(_) => ErrorKind::DecryptionError,
            SearchError::ConfigMismatch(_) => ErrorKind::ConfigMismatch,
            SearchError::Storage(_) => ErrorKind::StorageError,
            SearchError::Internal(_) => ErrorKind::InternalError,
        }
    }
}

impl From<FheError> for SearchError {
    fn from(e: FheError) -> Self {
        let msg = e.to_string();
        match e {
            FheError::KeyMissing(_) => SearchError::KeyMissing(msg),
            FheError::InvalidKeyMaterial(_) => SearchError::ConfigMismatch(msg),
            FheError::KeyGeneration(_) => SearchError::Internal(msg),
            FheError::Compilation(_) => SearchError::Compilation(msg),
            FheError::Evaluation(_) => SearchError::Evaluation(msg),
            FheError::Decryption(_) => SearchError::Decryption(msg),
            FheError::DimensionMismatch { expected, actual } => {
                SearchError::DimensionMismatch { expected, actual }
            }
            FheError::ValueOutOfRange { .. } => SearchError::ConfigMismatch(msg),
            FheError::Storage(_) => SearchError::Storage(msg),
        }
    }
}

impl From<std::io::Error> for SearchError {
    fn from(e: std::io::Error) -> Self {
        SearchError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(e: serde_json::Error) -> Self {
        SearchError::Storage(format!("json: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fhe_errors_map_to_taxonomy() {
        let cases = [
            (FheError::KeyMissing("x".into()), ErrorKind::KeyMissingError),
            (FheError::InvalidKeyMaterial("x".into()), ErrorKind::ConfigMismatch),
            (FheError::KeyGeneration("x".into()), ErrorKind::InternalError),
            (FheError::Compilation("x".into()), ErrorKind::CompilationError),
            (FheError::Evaluation("x".into()), ErrorKind::EvaluationError),
            (FheError::Decryption("x".into()), ErrorKind::DecryptionError),
            (
                FheError::DimensionMismatch {
                    expected: 2,
                    actual: 3,
                },
                ErrorKind::DimensionMismatch,
            ),
            (
                FheError::ValueOutOfRange {
                    index: 0,
                    value: 9,
                    bits: 4,
                },
                ErrorKind::ConfigMismatch,
            ),
        ];
        for (fhe, kind) in cases {
            assert_eq!(SearchError::from(fhe).kind(), kind);
        }
    }

    #[test]
    fn key_errors_carry_their_own_cause() {
        let failed = SearchError::from(FheError::KeyGeneration("rng exhausted".into()));
        assert_eq!(failed.to_string(), "internal error: key generation failed: rng exhausted");

        let malformed = SearchError::from(FheError::InvalidKeyMaterial("bad id".into()));
        assert!(malformed.kind().is_caller_error());
        assert!(!malformed.to_string().contains("generate_keys"));
    }

    #[test]
    fn kind_serializes_with_taxonomy_name() {
        let json = serde_json::to_string(&ErrorKind::KeyMissingError).unwrap();
        assert_eq!(json, "\"KeyMissingError\"");
        assert!(ErrorKind::ConfigMismatch.is_caller_error());
        assert!(!ErrorKind::EvaluationError.is_caller_error());
    }
}
