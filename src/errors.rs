//! Error types for the mongrations engine.
//!
//! The taxonomy separates problems detected before execution starts
//! (configuration, history inconsistency) from problems raised while a run
//! is in flight (source incompatibility, operation failure, storage).

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MongrationError>;

/// The main error type for mongration operations.
#[derive(Debug, Error)]
pub enum MongrationError {
    /// A migration is misconfigured. Detected before anything runs; the
    /// whole batch is aborted without partial execution.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// An operation received a source type it does not support.
    #[error("incompatible source for {operation} operation: {source_kind}")]
    SourceIncompatibility {
        /// The operation that rejected the source.
        operation: String,
        /// Description of the offending source.
        source_kind: String,
    },

    /// An operation raised while a phase was running. Fatal to the run;
    /// recorded as `FAILED` before being re-propagated.
    #[error("operation failed in phase '{phase}'")]
    Operation {
        /// The phase whose operation raised.
        phase: String,
        /// The triggering cause.
        #[source]
        source: Box<MongrationError>,
    },

    /// A user-supplied callback raised.
    #[error("callback failed: {0}")]
    Callback(String),

    /// The durable run history violates the completion-ordering invariant.
    #[error("run '{later}' is completed but earlier run '{earlier}' is not")]
    HistoryInconsistency {
        /// The earlier-indexed, not-completed run.
        earlier: String,
        /// The later-indexed, completed run.
        later: String,
    },

    /// The backing document store reported an error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A document was pushed into a pipe after it was closed.
    #[error("pipe is closed")]
    PipeClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MongrationError {
    /// Wraps a user callback error, preserving its chain in the message.
    pub fn callback(err: anyhow::Error) -> Self {
        Self::Callback(format!("{err:#}"))
    }
}

/// Error raised when a migration's phases are misconfigured.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The phases involved in the error.
    pub phases: Vec<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            phases: Vec::new(),
        }
    }

    /// Sets the phases involved.
    #[must_use]
    pub fn with_phases(mut self, phases: Vec<String>) -> Self {
        self.phases = phases;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_carries_phase_names() {
        let err = ConfigurationError::new("missing destination")
            .with_phases(vec!["build".to_string(), "index".to_string()]);
        assert_eq!(err.phases.len(), 2);
        assert_eq!(err.to_string(), "missing destination");
    }

    #[test]
    fn source_incompatibility_is_a_leaf_error() {
        let err = MongrationError::SourceIncompatibility {
            operation: "aggregation".to_string(),
            source_kind: "pipe".to_string(),
        };
        assert!(err.to_string().contains("pipe"));
        // Describes the source *kind*; there is no underlying error chain.
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn operation_error_chains_cause() {
        let cause = MongrationError::Callback("boom".to_string());
        let err = MongrationError::Operation {
            phase: "reshape".to_string(),
            source: Box::new(cause),
        };
        assert!(err.to_string().contains("reshape"));
        let chained = std::error::Error::source(&err);
        assert!(chained.is_some());
    }
}
