//! Error types for the batch engine

use thiserror::Error;

/// Result type alias using our EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for batch engine operations
///
/// Nothing in the engine terminates the process on these. Every variant
/// degrades to "skip this action, keep existing state, retry next cycle".
#[derive(Error, Debug)]
pub enum EngineError {
    /// Persisted state belongs to another account or strategy tag
    #[error("Snapshot mismatch: {field} saved={saved}, current={current}")]
    ConfigMismatch {
        field: &'static str,
        saved: String,
        current: String,
    },

    /// Broker could not be reached (transient)
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Broker refused an order (invalid volume, stops, margin)
    #[error("Order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: String },

    /// Some layers kept their old broker-side target
    #[error("Target propagation partial: {updated}/{total} layers updated")]
    TargetPropagationPartial { updated: usize, total: usize },

    /// Snapshot file could not be parsed
    #[error("Corrupt snapshot {path}: {reason}")]
    CorruptSnapshot { path: String, reason: String },

    /// No batch with this id
    #[error("Batch not found: {0}")]
    BatchNotFound(u64),

    /// Emergency stop is active
    #[error("Emergency stop active: {0}")]
    EmergencyStop(String),

    /// Order label does not follow the batch label format
    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    /// Non-positive or otherwise unusable volume
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// File system errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Returns true for failures that are expected to clear on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::BrokerUnavailable(_) | EngineError::TargetPropagationPartial { .. }
        )
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}
