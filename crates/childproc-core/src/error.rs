use std::time::Duration;
use thiserror::Error;

/// Error types for child process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Executable not found: {0}")]
    FileNotFound(String),

    #[error("Failed to start '{file_name}': {source}")]
    Spawn {
        file_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process handle is not valid (already released)")]
    InvalidHandle,

    #[error("No such process: {0}")]
    NoSuchProcess(u32),

    #[error("Operation not supported on this platform: {0}")]
    PlatformNotSupported(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn spawn(file_name: impl Into<String>, source: std::io::Error) -> Self {
        ProcessError::Spawn {
            file_name: file_name.into(),
            source,
        }
    }

    /// The OS error code carried by this error, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ProcessError::Spawn { source, .. } => source.raw_os_error(),
            ProcessError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Check if this error means the executable could not be located
    pub fn is_not_found(&self) -> bool {
        match self {
            ProcessError::FileNotFound(_) => true,
            ProcessError::Spawn { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this error is a read-level timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout(_))
    }
}

pub type Result<T, E = ProcessError> = std::result::Result<T, E>;
