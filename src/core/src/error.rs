use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Layersift error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Local container runtime not reachable or misbehaving
    #[error("container runtime error: {0}")]
    ContainerApi(String),

    /// Image absent locally or at the registry
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Runtime cannot export the image
    #[error("image export not supported: {0}")]
    DriverApiNotSupport(String),

    /// I/O against scratch or layer directories failed
    #[error("filesystem error: {0}")]
    FileSystem(String),

    /// Image tarball is structurally invalid
    #[error("invalid image package: {0}")]
    Package(String),

    /// HTTP or content error against the registry
    #[error("registry error: {0}")]
    RegistryApi(String),

    /// Ambient context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Package(err.to_string())
    }
}

impl From<serde_yaml::Error> for ScanError {
    fn from(err: serde_yaml::Error) -> Self {
        ScanError::Config(err.to_string())
    }
}

/// Stable error codes surfaced to the scan orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorCode {
    None,
    ContainerApi,
    ImageNotFound,
    DriverApiNotSupport,
    FileSystem,
    Package,
    RegistryApi,
}

impl ScanError {
    /// Map the error onto the stable code taxonomy.
    pub fn code(&self) -> ScanErrorCode {
        match self {
            ScanError::ContainerApi(_) => ScanErrorCode::ContainerApi,
            ScanError::ImageNotFound(_) => ScanErrorCode::ImageNotFound,
            ScanError::DriverApiNotSupport(_) => ScanErrorCode::DriverApiNotSupport,
            ScanError::FileSystem(_) | ScanError::Io(_) => ScanErrorCode::FileSystem,
            ScanError::Package(_) => ScanErrorCode::Package,
            ScanError::RegistryApi(_) => ScanErrorCode::RegistryApi,
            // cancellation and config failures surface through the same
            // channel the original used for local I/O aborts
            ScanError::Cancelled | ScanError::Config(_) => ScanErrorCode::FileSystem,
        }
    }
}

/// Result type alias for layersift operations
pub type Result<T> = std::result::Result<T, ScanError>;
