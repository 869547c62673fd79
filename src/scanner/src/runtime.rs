//! Local container runtime access.
//!
//! The pipeline talks to a Docker-compatible runtime through the traits
//! below; the concrete socket client lives outside this crate. A repo
//! string may carry its runtime socket in-band
//! (`tcp://host:port/actual/repo`), which is split off here.

use std::collections::HashMap;

use async_trait::async_trait;
use layersift_core::error::Result;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// Image metadata reported by the local runtime or assembled from a
/// registry manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMeta {
    pub id: String,
    pub digest: String,
    /// Content-addressable layer digests, bottom-up
    pub layers: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub repo_tags: Vec<String>,
}

/// One entry of the image build history, bottom-up. A zero `size` marks a
/// metadata-only instruction that produced no filesystem diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub cmd: String,
    pub size: i64,
}

/// Byte stream of an exported image tar.
pub type ImageStream = Box<dyn AsyncRead + Send + Unpin>;

/// Interface to a local container runtime over one socket.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspect an image by `repo:tag` name.
    async fn get_image(&self, name: &str) -> Result<ImageMeta>;

    /// Build history of an image, oldest entry first.
    async fn get_image_history(&self, name: &str) -> Result<Vec<HistoryEntry>>;

    /// Export the image as a tar stream (`docker save` semantics).
    async fn get_image_file(&self, id: &str) -> Result<ImageStream>;
}

/// Connects to a runtime socket on demand.
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    async fn connect(&self, socket: &str) -> Result<Box<dyn ContainerRuntime>>;
}

const TCP_SCHEME: &str = "tcp://";

/// Split an in-band `tcp://host:port/repo` socket prefix off a repository
/// string. Returns `(socket, repo)`; the socket is `None` when the repo
/// carries no prefix.
pub fn parse_socket_from_repo(repo: &str) -> (Option<&str>, &str) {
    if let Some(rest) = repo.strip_prefix(TCP_SCHEME) {
        if let Some(n) = rest.find('/') {
            if n > 0 {
                return (Some(&repo[..n + TCP_SCHEME.len()]), &rest[n + 1..]);
            }
        }
    }
    (None, repo)
}
