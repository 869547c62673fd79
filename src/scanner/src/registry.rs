//! Registry access over the v2 HTTP API.
//!
//! Remote layers are plain blobs: `GET <url>/v2/<repo>/blobs/<digest>`.
//! Token negotiation belongs to the caller; an already-negotiated bearer
//! token may be attached to the client. Blob bodies are streamed, never
//! buffered whole, so the acquirer's byte budget stays meaningful.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use layersift_core::config::ScanConfig;
use layersift_core::error::{Result, ScanError};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acquire::{LayerReader, LayerStream};
use crate::harvest::LayerFiles;
use crate::image;

/// Minimal v2 registry client.
#[derive(Clone)]
pub struct RegistryClient {
    url: String,
    client: reqwest::Client,
    token: Option<String>,
    retry_limit: u32,
}

/// Parsed view of a fetched manifest, with the raw body preserved for
/// signature verification.
#[derive(Debug, Clone)]
pub struct RegistryManifest {
    pub raw: String,
    /// Layer digests in manifest order
    pub layers: Vec<String>,
    /// Declared blob sizes by digest
    pub sizes: HashMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct ManifestLayer {
    digest: String,
    #[serde(default)]
    size: i64,
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    layers: Vec<ManifestLayer>,
}

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

impl RegistryClient {
    /// Create a client for one registry endpoint.
    pub fn new(url: impl Into<String>, token: Option<String>, config: &ScanConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.data_timeout())
            .build()
            .map_err(|err| ScanError::RegistryApi(err.to_string()))?;

        let url: String = url.into();
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            token,
            retry_limit: config.retry_limit,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Fetch a manifest by tag or digest, keeping the raw body.
    pub async fn image_manifest(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        reference: &str,
    ) -> Result<RegistryManifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.url, repo, reference);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ScanError::Cancelled),
            resp = self.get(&url).header("Accept", MANIFEST_ACCEPT).send() => {
                resp.map_err(|err| ScanError::RegistryApi(err.to_string()))?
            }
        };

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ScanError::ImageNotFound(format!("{}:{}", repo, reference)));
        }
        let response = response
            .error_for_status()
            .map_err(|err| ScanError::RegistryApi(err.to_string()))?;

        let raw = response
            .text()
            .await
            .map_err(|err| ScanError::RegistryApi(err.to_string()))?;
        let doc: ManifestDoc = serde_json::from_str(&raw)
            .map_err(|err| ScanError::RegistryApi(format!("invalid manifest: {}", err)))?;

        let mut layers = Vec::with_capacity(doc.layers.len());
        let mut sizes = HashMap::with_capacity(doc.layers.len());
        for layer in doc.layers {
            sizes.insert(layer.digest.clone(), layer.size);
            layers.push(layer.digest);
        }

        Ok(RegistryManifest { raw, layers, sizes })
    }

    /// Open the blob stream of one layer.
    ///
    /// Transient failures are retried up to the configured limit;
    /// cancellation is terminal and never retried.
    pub async fn download_layer(
        &self,
        cancel: &CancellationToken,
        repo: &str,
        digest: &str,
    ) -> Result<(LayerStream, i64)> {
        let url = blob_url(&self.url, repo, digest);
        debug!(%digest, "download layer blob");

        let mut last_err = ScanError::RegistryApi(format!("no attempt made for {}", digest));
        let mut attempt = 0;
        while attempt < self.retry_limit {
            attempt += 1;

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                resp = self.get(&url).send() => resp,
            };

            match response.and_then(|resp| resp.error_for_status()) {
                Ok(resp) => {
                    let len = resp.content_length().map(|l| l as i64).unwrap_or(-1);
                    let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
                    return Ok((Box::new(StreamReader::new(stream)), len));
                }
                Err(err) => {
                    warn!(%digest, attempt, %err, "layer blob request failed");
                    last_err = ScanError::RegistryApi(err.to_string());
                    if cancel.is_cancelled() {
                        return Err(ScanError::Cancelled);
                    }
                }
            }
        }

        Err(last_err)
    }
}

/// Blob endpoint for one layer digest.
pub(crate) fn blob_url(url: &str, repo: &str, digest: &str) -> String {
    format!("{}/v2/{}/blobs/{}", url, repo, digest)
}

struct RemoteLayerReader {
    client: RegistryClient,
    repo: String,
}

#[async_trait]
impl LayerReader for RemoteLayerReader {
    async fn open(&self, cancel: &CancellationToken, layer: &str) -> Result<(LayerStream, i64)> {
        self.client.download_layer(cancel, &self.repo, layer).await
    }
}

/// Download every layer of a remote image into `img_path` and harvest the
/// package files per layer. `sizes` comes from the schema v2 manifest and
/// may be empty for schema v1.
pub async fn download_remote_image(
    cancel: &CancellationToken,
    client: &RegistryClient,
    name: &str,
    img_path: &Path,
    layers: &[String],
    sizes: &HashMap<String, i64>,
    config: &ScanConfig,
) -> Result<HashMap<String, LayerFiles>> {
    debug!(name, "download remote image");

    let reader = Arc::new(RemoteLayerReader {
        client: client.clone(),
        repo: name.to_string(),
    });
    image::image_layer_iterate(cancel, layers, sizes, img_path, reader, config, None).await
}
