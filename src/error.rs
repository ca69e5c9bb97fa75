//! Error types for patch generation and application

use thiserror::Error;

/// Result type for patch operations
pub type Result<T> = std::result::Result<T, PatchError>;

/// Errors that can occur while writing, reading or applying a patch.
///
/// Every variant is fatal to the patch being processed: patches are applied
/// all-or-nothing and nothing here is retried internally.
#[derive(Error, Debug)]
pub enum PatchError {
    /// Failure of the underlying byte source or sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-sequence patch structure
    #[error("Invalid patch format: {0}")]
    Format(String),

    /// A copy op reaches outside the target file
    #[error(
        "Copy out of range: offset {offset} + length {length} exceeds target size {target_size}"
    )]
    Range {
        offset: u64,
        length: u64,
        target_size: u64,
    },

    /// Reconstructed file does not have the size its container records
    #[error("Size mismatch for file {file_index}: expected {expected} bytes, got {actual} bytes")]
    Consistency {
        file_index: usize,
        expected: u64,
        actual: u64,
    },

    /// Container layout violates its invariants
    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    /// A message could not be serialized
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Partition of {len} bytes exceeds the suffix sort limit of {max} bytes")]
    PartitionTooLarge { len: usize, max: usize },

    #[error("Failed to start suffix sort workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl PatchError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        PatchError::Format(msg.into())
    }

    pub fn is_format(&self) -> bool {
        matches!(self, PatchError::Format(_))
    }

    pub fn is_range(&self) -> bool {
        matches!(self, PatchError::Range { .. })
    }

    pub fn is_consistency(&self) -> bool {
        matches!(self, PatchError::Consistency { .. })
    }
}
