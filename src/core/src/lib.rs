//! Layersift Core - Foundational Types
//!
//! This module provides the configuration and error types used across
//! the layersift image scan pipeline.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::ScanConfig;
pub use error::{Result, ScanError, ScanErrorCode};

/// Layersift version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
