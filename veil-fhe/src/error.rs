use thiserror::Error;

/// Failures of the homomorphic layer.
///
/// `Clone` so a failed single-flight compilation can hand the same error
/// to every caller that was waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FheError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key material missing: {0}")]
    KeyMissing(String),

    /// Supplied keys that cannot be decoded or do not belong together.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("circuit compilation failed: {0}")]
    Compilation(String),

    #[error("homomorphic evaluation failed: {0}")]
    Evaluation(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("value {value} at index {index} does not fit in {bits} bits")]
    ValueOutOfRange { index: usize, value: i64, bits: u8 },

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, FheError>;

impl From<std::io::Error> for FheError {
    fn from(e: std::io::Error) -> Self {
        FheError::Storage(e.to_string())
    }
}
