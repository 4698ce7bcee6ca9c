//! Error types shared across the engine.
//!
//! Estimation errors never leave the blender; they are folded into a degraded
//! estimate. Store errors are classified so the dispatcher can decide whether a
//! job is worth retrying without string matching.

use thiserror::Error;

/// Failures inside the mastery estimators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimationError {
    /// A feature could not be derived from the observation data.
    #[error("invalid feature: {0}")]
    InvalidFeature(String),

    /// The computation produced a non-finite value.
    #[error("non-finite result in {0}")]
    NonFinite(&'static str),
}

/// Failures reading a cached weight artifact. Logged, never surfaced.
#[derive(Debug, Error)]
pub enum WeightLoadError {
    #[error("failed to read weights: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse weights: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("corrupt weights: {0}")]
    Corrupt(String),
}

/// Failures talking to the persistence layer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or the transaction was aborted.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the write (constraint violation, unknown reference).
    #[error("store rejected write: {0}")]
    Rejected(String),

    /// Stored data could not be decoded.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns `true` if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Intake failures reported synchronously to the submitter.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("dispatcher is shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Rejected("fk".into()).is_transient());
        assert!(!StoreError::Corrupt("bad row".into()).is_transient());
    }
}
