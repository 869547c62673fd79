//! Cosign signature image retrieval.
//!
//! A Cosign signature lives in the registry as a secondary image under a
//! tag derived from the signed image's digest. Its layers are small JSON
//! payload blobs. This module fetches the signature manifest and payloads;
//! cryptographic verification happens elsewhere.
//!
//! See <https://github.com/sigstore/cosign/blob/main/specs/SIGNATURE_SPEC.md>.

use std::collections::HashMap;

use layersift_core::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::RegistryClient;

/// Signature image data retrieved from the registry for verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureData {
    /// The raw manifest JSON retrieved from the registry
    pub manifest: String,
    /// Signature payloads referenced by the manifest, keyed by blob digest
    pub payloads: HashMap<String, String>,
}

/// Derive the Cosign signature tag for an image digest
/// (`sha256:abc...` becomes `sha256-abc....sig`).
pub fn cosign_signature_tag(digest: &str) -> String {
    format!("{}.sig", digest.replacen(':', "-", 1))
}

/// Fetch the signature image's manifest and payload layers for the given
/// repository and digest.
pub async fn signature_data_for_image(
    cancel: &CancellationToken,
    client: &RegistryClient,
    repo: &str,
    digest: &str,
) -> Result<SignatureData> {
    let tag = cosign_signature_tag(digest);
    debug!(repo, %tag, "fetch signature image");

    let manifest = client.image_manifest(cancel, repo, &tag).await?;

    let mut payloads = HashMap::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let (mut stream, _) = client
            .download_layer(cancel, repo, layer)
            .await
            .map_err(|err| ScanError::RegistryApi(err.to_string()))?;

        let mut data = Vec::new();
        stream
            .read_to_end(&mut data)
            .await
            .map_err(|err| ScanError::RegistryApi(err.to_string()))?;
        payloads.insert(layer.clone(), String::from_utf8_lossy(&data).into_owned());
    }

    Ok(SignatureData {
        manifest: manifest.raw,
        payloads,
    })
}
