//! Error types for the buffer cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Device operation that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    /// Block load (device read)
    Read,
    /// Block flush (device write)
    Write,
}

impl std::fmt::Display for DeviceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceOp::Read => write!(f, "read"),
            DeviceOp::Write => write!(f, "write"),
        }
    }
}

/// Errors that can occur in the buffer cache
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Entry, payload or scheduler could not be created
    #[error("Allocation failed for {what}: {reason}")]
    AllocationFailed { what: &'static str, reason: String },

    /// The storage device rejected a read or write
    #[error("Device {op} of block {block} failed: {reason}")]
    DeviceFailure {
        block: u64,
        op: DeviceOp,
        reason: String,
    },

    /// Block number outside the device
    #[error("Block {block} out of range (device has {disk_blocks} blocks)")]
    BlockOutOfRange { block: u64, disk_blocks: u64 },

    /// Caller buffer is not exactly one block
    #[error("Invalid buffer size: expected {expected} bytes, got {actual}")]
    InvalidBuffer { expected: usize, actual: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cache no longer accepts work
    #[error("Buffer cache is shut down")]
    ShutDown,

    /// Shutdown finished with blocks whose flush failed
    #[error("Shutdown left {blocks} dirty block(s) unflushed")]
    DirtyOnShutdown { blocks: usize },

    /// I/O error from a file-backed device
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Build a device failure for `block`
    pub fn device(block: u64, op: DeviceOp, reason: impl Into<String>) -> Self {
        Error::DeviceFailure {
            block,
            op,
            reason: reason.into(),
        }
    }

    /// Whether this error came from the storage device
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Error::DeviceFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_failure_display() {
        let err = Error::device(7, DeviceOp::Write, "media error");
        assert_eq!(
            err.to_string(),
            "Device write of block 7 failed: media error"
        );
        assert!(err.is_device_failure());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(ref msg) if msg.contains("short read")));
        assert!(!err.is_device_failure());
    }
}
