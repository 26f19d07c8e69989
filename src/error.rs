//! Error types for head sparsification and tensor recording
//!
//! Every variant except [`SparsityError::Candle`] and [`SparsityError::Io`]
//! signals a wiring bug between the model and the instrumentation. They are
//! propagated unmodified: once a shape or range check fails, the masked
//! output can no longer be trusted.

use thiserror::Error;

/// Result alias for the instrumentation core
pub type Result<T> = std::result::Result<T, SparsityError>;

/// Errors raised by head selection, head masking and recording
#[derive(Debug, Error)]
pub enum SparsityError {
    /// Requested number of kept heads is negative or exceeds the head count
    ///
    /// `num_heads` is `None` when `k` was rejected before any attention
    /// weights were seen (negative `k` in a config).
    #[error("k ({k}) out of range: {}", range_hint(*.num_heads))]
    KOutOfRange { k: i64, num_heads: Option<usize> },

    /// Selection and attention tensors disagree on batch, position or head dims
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A post-condition of the selector or mask builder did not hold
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Failure inside the tensor backend
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Failure writing recorded tensors to disk
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn range_hint(num_heads: Option<usize>) -> String {
    match num_heads {
        Some(n) => format!("must be in 0..={n} (number of attention heads)"),
        None => "must not be negative".to_string(),
    }
}

impl SparsityError {
    /// Whether this error comes from caller wiring rather than the backend
    pub fn is_wiring_bug(&self) -> bool {
        matches!(
            self,
            Self::KOutOfRange { .. } | Self::ShapeMismatch(_) | Self::InvariantViolation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_error_message() {
        let err = SparsityError::KOutOfRange {
            k: 9,
            num_heads: Some(8),
        };
        assert_eq!(
            err.to_string(),
            "k (9) out of range: must be in 0..=8 (number of attention heads)"
        );
        assert!(err.is_wiring_bug());

        let err = SparsityError::KOutOfRange {
            k: -2,
            num_heads: None,
        };
        assert_eq!(err.to_string(), "k (-2) out of range: must not be negative");
    }

    #[test]
    fn test_backend_errors_are_not_wiring_bugs() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: SparsityError = io.into();
        assert!(!err.is_wiring_bug());
    }
}
