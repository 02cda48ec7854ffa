//! The frame loader contract.
//!
//! Decoding and disk layout live outside the engine; the cache only sees
//! this trait. Implementations pull one frame from the decoder or from
//! extracted JPEG files and return the decoded buffer. They must be
//! thread-safe and reentrant (the worker pool and the foreground miss
//! path call concurrently) and must honor the deadline within a small
//! tolerance; results that arrive late are abandoned by the caller and
//! counted as overruns.

use frame_store::{FrameBuffer, FrameKey};
use std::time::Instant;

/// Errors a loader may return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// No source exists for this frame.
    #[error("frame source missing: {0}")]
    Missing(String),
    /// Decoding the frame failed.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The deadline expired before the frame was ready.
    #[error("load deadline exceeded")]
    DeadlineExceeded,
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

/// Result type for loader calls.
pub type LoadResult = Result<FrameBuffer, LoadError>;

/// Produces one decoded frame on demand.
pub trait FrameLoader: Send + Sync {
    /// Load the frame for `key`, observing `deadline`.
    fn load(&self, key: FrameKey, deadline: Instant) -> LoadResult;
}

impl<F> FrameLoader for F
where
    F: Fn(FrameKey, Instant) -> LoadResult + Send + Sync,
{
    fn load(&self, key: FrameKey, deadline: Instant) -> LoadResult {
        self(key, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_store::PixelLayout;
    use std::time::Duration;

    #[test]
    fn test_closure_is_a_loader() {
        let loader = |key: FrameKey, _deadline: Instant| {
            Ok(FrameBuffer::new(
                1,
                1,
                PixelLayout::Gray8,
                vec![key.index() as u8].into(),
            ))
        };
        let buffer = loader
            .load(FrameKey::new(7), Instant::now() + Duration::from_millis(50))
            .unwrap();
        assert_eq!(buffer.data(), &[7]);
    }

    #[test]
    fn test_load_error_display() {
        assert_eq!(
            LoadError::DeadlineExceeded.to_string(),
            "load deadline exceeded"
        );
        assert_eq!(
            LoadError::Decode("bad marker".into()).to_string(),
            "decode failed: bad marker"
        );
    }
}
