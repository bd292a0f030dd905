//! Error types for lindb.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for lindb operations.
pub type Result<T> = std::result::Result<T, LinDbError>;

/// Main error type for lindb operations.
#[derive(Error, Debug)]
pub enum LinDbError {
    #[error("Invalid timestamp range: start {start} > end {end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid segment name: {0}")]
    InvalidSegment(String),

    #[error("Metric name is required")]
    MetricRequired,

    #[error("Metric not found: {0}")]
    MetricNotFound(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Shard {shard_id} not found in database '{database}'")]
    ShardNotFound { database: String, shard_id: u32 },

    #[error("kv family not found: {0}")]
    FamilyNotFound(String),

    #[error("Timestamp {timestamp} is outside the writable window [{min}, {max}]")]
    OutOfWritableWindow { timestamp: i64, min: i64, max: i64 },

    #[error("Memory database is read only")]
    MemoryDatabaseReadOnly,

    #[error("Memory database is closed")]
    MemoryDatabaseClosed,

    #[error("Engine is shutting down")]
    EngineShuttingDown,

    #[error("Engine already closed")]
    EngineClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("Failed to unmarshal physical plan: {0}")]
    UnmarshalPlan(String),

    #[error("Invalid physical plan: {0}")]
    InvalidPlan(String),

    #[error("Wrong request: node '{node}' is not part of the physical plan")]
    WrongRequest { node: String },

    #[error("No send stream for node '{0}'")]
    NoSendStream(String),

    #[error("No task sender for node '{0}'")]
    NoTaskSender(String),

    #[error("Failed to send task to node '{node}': {details}")]
    TaskSend { node: String, details: String },

    #[error("Database '{0}' does not exist on this node")]
    NoDatabase(String),

    #[error("Query task panicked: {0}")]
    TaskPanicked(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },

    #[error("Channel timeout after {timeout_ms}ms")]
    ChannelTimeout { timeout_ms: u64 },

    #[error("Memory map error at {path:?}: {details}")]
    MemoryMap { path: PathBuf, details: String },

    #[error("Other error: {0}")]
    Other(String),
}

impl LinDbError {
    /// Wraps an IO error with the path that caused it.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LinDbError::IoWithPath {
            path: path.into(),
            source,
        }
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for LinDbError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        LinDbError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvError> for LinDbError {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        LinDbError::ChannelReceive {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvTimeoutError> for LinDbError {
    fn from(e: crossbeam_channel::RecvTimeoutError) -> Self {
        match e {
            crossbeam_channel::RecvTimeoutError::Timeout => LinDbError::ChannelReceive {
                channel: "recv_timeout: duration unavailable".to_string(),
            },
            crossbeam_channel::RecvTimeoutError::Disconnected => LinDbError::ChannelReceive {
                channel: "timeout: channel disconnected".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_errors_render_the_node() {
        let err = LinDbError::WrongRequest {
            node: "1.1.1.1:9000".to_string(),
        };
        assert!(err.to_string().contains("1.1.1.1:9000"));

        let err = LinDbError::TaskSend {
            node: "leaf-1".to_string(),
            details: "broken pipe".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to send task to node 'leaf-1': broken pipe"
        );
    }

    #[test]
    fn channel_errors_convert() {
        let (tx, rx) = crossbeam_channel::bounded::<u8>(1);
        drop(rx);
        let err: LinDbError = tx.send(1).unwrap_err().into();
        assert!(matches!(err, LinDbError::ChannelSend { .. }));
    }
}
