//! Error types for episodic experiments

use thiserror::Error;

use crate::task::TaskState;

/// Core error type for scheduling, collection and optimization
#[derive(Error, Debug)]
pub enum MbrlError {
    /// Malformed or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while driving the robot during an episode
    #[error("Robot I/O error: {0}")]
    RobotIo(String),

    /// Local model training or policy optimization failed
    #[error("Optimization error: {0}")]
    Optimization(String),

    /// Remote optimization service failure or malformed response
    #[error("Remote service error: {0}")]
    RemoteService(String),

    /// Experience could not be loaded or saved
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Rejected task state transition
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        /// Task being transitioned
        task: String,
        /// Current state
        from: TaskState,
        /// Rejected target state
        to: TaskState,
    },

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MbrlError {
    /// Whether this error should abort only the current task cycle
    /// rather than the whole process
    #[must_use]
    pub fn is_cycle_local(&self) -> bool {
        matches!(
            self,
            Self::RobotIo(_)
                | Self::Optimization(_)
                | Self::RemoteService(_)
                | Self::DimensionMismatch { .. }
        )
    }
}

/// Result type alias for episodic operations
pub type Result<T> = std::result::Result<T, MbrlError>;
