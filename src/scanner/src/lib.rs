//! Layersift Scanner - image layer acquisition and package extraction.
//!
//! Given a locally resident image (through a container runtime socket) or
//! a remote image reference (through the registry v2 API), this crate
//! materializes every filesystem layer, merges the layer history into one
//! canonical ordered view, and harvests the files downstream vulnerability
//! analysis consumes.
//!
//! # Architecture
//!
//! ```text
//!    local runtime OR registry
//!           │
//!           ▼                         manifest resolver      history
//!    image tar on disk ──► selective archive reader ──┐         │
//!                                                     ▼         ▼
//!                                           layer acquirer ──► extracted dirs
//!                                                     │
//!                                                     ▼
//!                                           layer file harvester
//!                                                     │
//!                                                     ▼
//!                                          history reconciler ──► ImageInfo
//! ```

pub mod acquire;
pub mod archive;
pub mod harvest;
pub mod image;
pub mod manifest;
pub mod pkg;
pub mod registry;
pub mod runtime;
pub mod signature;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export common types
pub use acquire::{download_layers, DownloadResult, LayerReader, LayerStream, EXTRACT_SENTINEL};
pub use harvest::LayerFiles;
pub use image::{normalize_image_cmd, HarvestHooks, ImageInfo, ImageScanner, LocalImage};
pub use manifest::{ImageManifest, LayerMetadata, TarLayout};
pub use pkg::{AppPackage, AppScanner, PackageIngest};
pub use registry::{download_remote_image, RegistryClient, RegistryManifest};
pub use runtime::{ContainerRuntime, HistoryEntry, ImageMeta, RuntimeConnector};
pub use signature::{cosign_signature_tag, signature_data_for_image, SignatureData};

/// Layersift Scanner version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
