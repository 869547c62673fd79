//! Image loading and history reconciliation.
//!
//! A locally resident image is exported through the runtime socket,
//! resolved into per-layer tars, extracted under the image scratch path
//! and harvested. The runtime, the export tarball and the build history
//! each name layers differently; the reconciliation below produces one
//! history-aligned view keyed by the runtime's content-addressable
//! digests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use layersift_core::config::ScanConfig;
use layersift_core::error::{Result, ScanError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::acquire::{self, LayerReader, LayerStream};
use crate::harvest::{self, LayerFiles};
use crate::manifest;
use crate::pkg::{AppScanner, ManifestNameScanner, PackageIngest, RawPackageIngest};
use crate::runtime::{parse_socket_from_repo, HistoryEntry, RuntimeConnector};

/// History-aligned description of a loaded image.
///
/// `layers[i]` and `cmds[i]` line up with the full build history; empty
/// strings in `layers` mark zero-size history entries.
#[derive(Debug, Clone, Default)]
pub struct ImageInfo {
    pub id: String,
    pub digest: String,
    pub layers: Vec<String>,
    pub cmds: Vec<String>,
    pub envs: Vec<String>,
    pub labels: HashMap<String, String>,
    pub repo_tags: Vec<String>,
}

/// Everything `load_local_image` produces.
#[derive(Debug, Default)]
pub struct LocalImage {
    pub info: ImageInfo,
    /// Harvested files keyed by runtime layer digest
    pub layer_files: HashMap<String, LayerFiles>,
    /// In-tarball layer IDs, bottom-up
    pub tar_layers: Vec<String>,
}

/// Ingestion seams handed to the harvester.
pub struct HarvestHooks {
    pub ingest: Arc<dyn PackageIngest>,
    pub apps: Arc<dyn AppScanner>,
}

impl Default for HarvestHooks {
    fn default() -> Self {
        Self {
            ingest: Arc::new(RawPackageIngest),
            apps: Arc::new(ManifestNameScanner),
        }
    }
}

/// Entry point for image acquisition against a local runtime.
pub struct ImageScanner {
    config: ScanConfig,
    connector: Arc<dyn RuntimeConnector>,
    hooks: HarvestHooks,
}

impl ImageScanner {
    pub fn new(config: ScanConfig, connector: Arc<dyn RuntimeConnector>) -> Self {
        Self {
            config,
            connector,
            hooks: HarvestHooks::default(),
        }
    }

    /// Replace the default package ingestion seams.
    pub fn with_hooks(mut self, hooks: HarvestHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Probe the runtime for image metadata without exporting anything.
    pub async fn local_image_meta(
        &self,
        _cancel: &CancellationToken,
        repository: &str,
        tag: &str,
    ) -> Result<crate::runtime::ImageMeta> {
        let (sock, repo) = parse_socket_from_repo(repository);
        let sock = sock.unwrap_or(&self.config.rt_sock);

        let rt = self.connector.connect(sock).await.map_err(|err| {
            error!(repo = repository, tag, %err, "connect runtime socket fail");
            err
        })?;

        rt.get_image(&format!("{}:{}", repo, tag)).await.map_err(|err| {
            error!(repo = repository, tag, %err, "failed to get local image");
            err
        })
    }

    /// Export a local image, extract every layer and harvest its package
    /// files, returning the history-aligned view.
    pub async fn load_local_image(
        &self,
        cancel: &CancellationToken,
        repository: &str,
        tag: &str,
        img_path: &Path,
    ) -> Result<LocalImage> {
        let (sock, repo) = parse_socket_from_repo(repository);
        let sock = sock.unwrap_or(&self.config.rt_sock);

        let rt = self.connector.connect(sock).await.map_err(|err| {
            error!(%err, "connect runtime socket fail");
            err
        })?;

        let image_name = format!("{}:{}", repo, tag);
        let meta = rt.get_image(&image_name).await?;
        let histories = rt.get_image_history(&image_name).await?;
        let mut export = rt.get_image_file(&meta.id).await?;

        // scratch folder for the export tar and intermediate layer tars;
        // removed when this call returns
        let scratch = RepoScratch::create(img_path)?;
        let image_tar = scratch.path().join("image.tar");

        let mut out = tokio::fs::File::create(&image_tar)
            .await
            .map_err(|err| ScanError::FileSystem(format!("could not create image tar: {}", err)))?;
        tokio::io::copy(&mut export, &mut out)
            .await
            .map_err(|err| ScanError::FileSystem(format!("could not write image tar: {}", err)))?;
        drop(out);

        // layer identity and build metadata, bottom-up
        let repo_dir = scratch.path().to_path_buf();
        let tar_path = image_tar.clone();
        let max_file_size = self.config.max_file_size;
        let layout = tokio::task::spawn_blocking(move || {
            manifest::resolve_image_tar(&repo_dir, &tar_path, max_file_size)
        })
        .await
        .map_err(|err| ScanError::FileSystem(err.to_string()))?
        .map_err(|err| {
            error!(%err, "could not extract image layers");
            match err {
                ScanError::Package(_) => err,
                other => ScanError::Package(other.to_string()),
            }
        })?;

        let reader = Arc::new(TarFileLayerReader {
            repo_dir: scratch.path().to_path_buf(),
        });
        let mut layer_files = image_layer_iterate(
            cancel,
            &layout.layer_ids,
            &HashMap::new(),
            img_path,
            reader,
            &self.config,
            Some(&self.hooks),
        )
        .await?;

        // the runtime and the tarball name the same layers differently;
        // re-key the harvest onto the runtime digests
        let tar_layers = layout.layer_ids.clone();
        rekey_layer_files(&mut layer_files, &layout.layer_ids, &meta.layers)?;

        let (layers, cmds) = align_history(&histories, &meta.layers, &mut layer_files);

        let info = ImageInfo {
            id: meta.id,
            digest: meta.digest,
            layers,
            cmds,
            envs: meta.env,
            labels: meta.labels,
            repo_tags: meta.repo_tags,
        };

        Ok(LocalImage {
            info,
            layer_files,
            tar_layers,
        })
    }
}

/// Download (or open) every layer, then harvest each extracted directory.
pub(crate) async fn image_layer_iterate(
    cancel: &CancellationToken,
    layers: &[String],
    sizes: &HashMap<String, i64>,
    img_path: &Path,
    reader: Arc<dyn LayerReader>,
    config: &ScanConfig,
    hooks: Option<&HarvestHooks>,
) -> Result<HashMap<String, LayerFiles>> {
    let default_hooks;
    let hooks = match hooks {
        Some(hooks) => hooks,
        None => {
            default_hooks = HarvestHooks::default();
            &default_hooks
        }
    };

    let (results, aggregate) =
        acquire::download_layers(cancel, layers, sizes, img_path, reader, config).await;
    if let Some(err) = aggregate {
        error!(%err, "open image layer fail");
        return Err(ScanError::FileSystem(err.to_string()));
    }

    let mut layer_files = HashMap::new();
    for layer in layers {
        if layer.is_empty() || layer_files.contains_key(layer) {
            continue;
        }
        let size = results.get(layer).map(|res| res.size).unwrap_or(0);
        let files = harvest::harvest_layer(
            &img_path.join(layer),
            size,
            config.max_file_size,
            hooks.ingest.as_ref(),
            hooks.apps.as_ref(),
        )?;
        layer_files.insert(layer.clone(), files);
    }

    Ok(layer_files)
}

/// Move every harvest entry from its tarball ID key to the runtime digest
/// at the same position. A count mismatch means the export and the
/// runtime disagree about the image.
fn rekey_layer_files(
    layer_files: &mut HashMap<String, LayerFiles>,
    tar_ids: &[String],
    digests: &[String],
) -> Result<()> {
    if tar_ids.len() != digests.len() {
        return Err(ScanError::Package(format!(
            "layer count mismatch: {} in tarball, {} in runtime",
            tar_ids.len(),
            digests.len()
        )));
    }
    for (tar_id, digest) in tar_ids.iter().zip(digests) {
        if let Some(files) = layer_files.remove(tar_id) {
            layer_files.insert(digest.clone(), files);
        }
    }
    Ok(())
}

/// Walk the build history and line the runtime layers up with it.
///
/// Zero-size history entries get an empty layer string; runtime layers
/// whose harvest came back empty are dropped so indices keep matching.
fn align_history(
    histories: &[HistoryEntry],
    meta_layers: &[String],
    layer_files: &mut HashMap<String, LayerFiles>,
) -> (Vec<String>, Vec<String>) {
    let mut layers = vec![String::new(); histories.len()];
    let mut cmds = vec![String::new(); histories.len()];

    let mut ml = 0;
    for (i, entry) in histories.iter().enumerate() {
        cmds[i] = normalize_image_cmd(&entry.cmd);
        if entry.size <= 0 {
            continue;
        }
        while ml < meta_layers.len() {
            let digest = &meta_layers[ml];
            match layer_files.get(digest) {
                Some(files) if files.size > 0 => {
                    layers[i] = digest.clone();
                    ml += 1;
                    break;
                }
                Some(_) => {
                    // zero-sized runtime layer; drop it so layers keep
                    // matching the history
                    layer_files.remove(digest);
                    ml += 1;
                }
                None => {
                    debug!(%digest, "no harvest for runtime layer");
                    ml += 1;
                }
            }
        }
    }

    (layers, cmds)
}

/// Strip the shell-invocation and no-op markers Docker records in history
/// commands.
pub fn normalize_image_cmd(cmd: &str) -> String {
    let cmd = cmd.strip_prefix("/bin/sh -c ").unwrap_or(cmd);
    let cmd = cmd.strip_prefix("#(nop) ").unwrap_or(cmd);
    cmd.trim().to_string()
}

/// Scratch `repo/` folder under the image path; removed on drop.
struct RepoScratch {
    dir: PathBuf,
}

impl RepoScratch {
    fn create(img_path: &Path) -> Result<Self> {
        let dir = img_path.join("repo");
        std::fs::create_dir_all(&dir).map_err(|err| {
            ScanError::FileSystem(format!("create scratch dir {}: {}", dir.display(), err))
        })?;
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for RepoScratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Reads layers of a local image back out of the scratch folder, where the
/// manifest resolver left them under their flattened file names.
struct TarFileLayerReader {
    repo_dir: PathBuf,
}

#[async_trait]
impl LayerReader for TarFileLayerReader {
    async fn open(&self, _cancel: &CancellationToken, layer: &str) -> Result<(LayerStream, i64)> {
        let path = self.repo_dir.join(format!("{}_layer.tar", layer));
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| ScanError::FileSystem(format!("open {}: {}", path.display(), err)))?;
        let size = file
            .metadata()
            .await
            .map_err(|err| ScanError::FileSystem(format!("stat {}: {}", path.display(), err)))?
            .len() as i64;
        Ok((Box::new(file), size))
    }
}
