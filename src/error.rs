use thiserror::Error;

/// Main error type for contrastive training
#[derive(Error, Debug, Clone)]
pub enum ContrastError {
    /// Relation and similarity tensors (or any pair of operands) disagree in shape
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Relation codes outside {0, 1, 2} or rows without exactly one instance positive
    #[error("Invalid relation: {0}")]
    InvalidRelation(String),

    /// Non-finite values, or cosine similarities above 1 beyond tolerance
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    /// Workers disagree on the local batch size during a gather
    #[error("Batch size mismatch: {0}")]
    BatchSizeMismatch(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Replica group errors (timeouts, ranks out of range)
    #[error("Distributed error: {0}")]
    DistributedError(String),

    /// IO errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ContrastError {
    /// Create a shape mismatch error naming both shapes
    pub fn shape_mismatch(what: &str, expected: &str, got: &str) -> Self {
        ContrastError::ShapeMismatch(format!("{}: expected {}, got {}", what, expected, got))
    }

    /// Create a relation error pointing at the offending row
    pub fn invalid_relation(row: usize, message: &str) -> Self {
        ContrastError::InvalidRelation(format!("row {}: {}", row, message))
    }

    /// Create a numerical instability error with the stage it was detected in
    pub fn numerical(stage: &str, message: &str) -> Self {
        ContrastError::NumericalInstability(format!("{}: {}", stage, message))
    }

    /// Create a batch size mismatch error from the per-rank row counts
    pub fn batch_size_mismatch(sizes: &[usize]) -> Self {
        ContrastError::BatchSizeMismatch(format!(
            "local batch sizes per rank {:?}; uniform batches are required (drop the remainder upstream)",
            sizes
        ))
    }
}

impl From<std::io::Error> for ContrastError {
    fn from(err: std::io::Error) -> Self {
        ContrastError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ContrastError {
    fn from(err: serde_json::Error) -> Self {
        ContrastError::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for ContrastError {
    fn from(err: bincode::Error) -> Self {
        ContrastError::SerializationError(err.to_string())
    }
}

/// Result type for contrastive training operations
pub type ContrastResult<T> = Result<T, ContrastError>;

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ShapeMismatch,
    InvalidRelation,
    NumericalInstability,
    BatchSizeMismatch,
    InvalidInput,
    ConfigInvalid,
    DistributedError,
    IoFailed,
    SerializationFailed,
}

impl ContrastError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ContrastError::ShapeMismatch(_) => ErrorCode::ShapeMismatch,
            ContrastError::InvalidRelation(_) => ErrorCode::InvalidRelation,
            ContrastError::NumericalInstability(_) => ErrorCode::NumericalInstability,
            ContrastError::BatchSizeMismatch(_) => ErrorCode::BatchSizeMismatch,
            ContrastError::InvalidInput(_) => ErrorCode::InvalidInput,
            ContrastError::ConfigurationError(_) => ErrorCode::ConfigInvalid,
            ContrastError::DistributedError(_) => ErrorCode::DistributedError,
            ContrastError::IoError(_) => ErrorCode::IoFailed,
            ContrastError::SerializationError(_) => ErrorCode::SerializationFailed,
        }
    }

    /// Check if this error is a step-level precondition violation.
    ///
    /// These abort the current training step. The trainer never retries them.
    pub fn is_step_fault(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::ShapeMismatch
                | ErrorCode::InvalidRelation
                | ErrorCode::NumericalInstability
                | ErrorCode::BatchSizeMismatch
        )
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(self.code(), ErrorCode::ConfigInvalid | ErrorCode::IoFailed)
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ContrastError::ShapeMismatch(msg) => {
                format!("Shape Error: {}\n\nThe relation tensor and the similarity matrix must both be (local batch, global batch). Check that every worker gathered the same number of rows.", msg)
            }
            ContrastError::InvalidRelation(msg) => {
                format!("Relation Error: {}\n\nEvery row needs exactly one instance positive (its paired view) and codes in {{0, 1, 2}}. Check the pair index mapping.", msg)
            }
            ContrastError::NumericalInstability(msg) => {
                format!("Numerical Error: {}\n\nFeatures must be finite and L2-normalized. Exploding gradients or a missing normalization layer are the usual causes.", msg)
            }
            ContrastError::BatchSizeMismatch(msg) => {
                format!("Batch Error: {}\n\nAll workers must contribute the same local batch size. Make the global batch divisible by the worker count.", msg)
            }
            _ => self.to_string(),
        }
    }
}
