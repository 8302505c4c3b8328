//! Error types for the suffix cache engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The shared-memory region could not be created or attached, or its
    /// named objects are missing. Fatal to the embedding process.
    #[error("shared arena unavailable: {0}")]
    ArenaUnavailable(String),

    /// A bulk allocation did not fit in the remaining arena space.
    #[error("shared arena out of space (requested {requested} bytes)")]
    OutOfSpace { requested: usize },

    /// The prompt registry has no free slots left.
    #[error("tree registry full (capacity {capacity})")]
    RegistryFull { capacity: usize },

    /// Batched inputs disagree on length.
    #[error("batch input mismatch: {reason}")]
    InputMismatch { reason: String },

    /// A per-request operation referenced a request with no fetched state.
    #[error("no speculation state for request {req_id}")]
    RequestStateMissing { req_id: String },

    /// The speculation worker pool could not be started.
    #[error("speculation worker pool: {0}")]
    WorkerPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_space_display_includes_size() {
        let err = CacheError::OutOfSpace { requested: 4096 };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn request_state_missing_display_includes_id() {
        let err = CacheError::RequestStateMissing {
            req_id: "req-17".into(),
        };
        assert!(err.to_string().contains("req-17"));
    }
}
