//! Error types for cache operations.

use std::fmt;

/// Errors surfaced by the cache facade.
///
/// Internal failures (loader errors, admission rejections for one result)
/// collapse into `NotFound` at the facade boundary; their cause is logged
/// and published as a structured warning event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The loader could not produce the frame within the remaining budget.
    NotFound,

    /// A single incoming buffer exceeds the hard byte limit even with the
    /// cache empty, or every resident entry is pinned and nothing can be
    /// evicted to make room.
    BudgetExhausted,

    /// Key outside the configured frame range. Caller error; returned
    /// synchronously without side effects.
    InvalidKey,

    /// No frame range is configured yet (no project open).
    NoProject,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "frame not found"),
            Self::BudgetExhausted => write!(f, "memory budget exhausted"),
            Self::InvalidKey => write!(f, "frame key out of range"),
            Self::NoProject => write!(f, "no project open"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CacheError::NotFound), "frame not found");
        assert_eq!(
            format!("{}", CacheError::BudgetExhausted),
            "memory budget exhausted"
        );
        assert_eq!(
            format!("{}", CacheError::InvalidKey),
            "frame key out of range"
        );
        assert_eq!(format!("{}", CacheError::NoProject), "no project open");
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<CacheError>();
    }
}
