//! Harvesting package-relevant files from extracted layer directories.
//!
//! After a layer has been unpacked under `<img_path>/<layer>/`, the walk
//! below picks out the files downstream vulnerability analysis consumes:
//! OS package databases, application package manifests, content manifests
//! and build-info Dockerfiles. Individual files that fail to parse are
//! dropped; only a broken walk aborts the harvest.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use layersift_core::error::{Result, ScanError};
use tracing::debug;

use crate::acquire::EXTRACT_SENTINEL;
use crate::pkg::{self, AppPackage, AppScanner, PackageIngest};

/// Files of interest collected from one layer.
#[derive(Debug, Default)]
pub struct LayerFiles {
    /// Decompressed size of the layer
    pub size: i64,
    /// Layer-relative path -> normalized file bytes
    pub pkgs: HashMap<String, Vec<u8>>,
    /// Layer-relative path -> parsed application packages
    pub apps: HashMap<String, Vec<AppPackage>>,
}

/// Walk `root` and map the layer-relative path of every regular file
/// accepted by `selected` to its absolute path. Files at or above
/// `max_file_size` (when positive) are skipped.
pub fn selective_files_from_path<F>(
    root: &Path,
    max_file_size: i64,
    selected: F,
) -> Result<HashMap<String, PathBuf>>
where
    F: Fn(&str, &Path) -> bool,
{
    let mut data = HashMap::new();
    walk_dir(root, root, max_file_size, &selected, &mut data)?;
    Ok(data)
}

fn walk_dir<F>(
    root: &Path,
    dir: &Path,
    max_file_size: i64,
    selected: &F,
    data: &mut HashMap<String, PathBuf>,
) -> Result<()>
where
    F: Fn(&str, &Path) -> bool,
{
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // symlinks are not followed; a layer diff only owns its own files
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk_dir(root, &path, max_file_size, selected, data)?;
        } else if meta.is_file() {
            if max_file_size > 0 && meta.len() as i64 >= max_file_size {
                continue;
            }
            let rel = match path.strip_prefix(root) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            if selected(&rel, &path) {
                data.insert(rel, path);
            }
        }
    }
    Ok(())
}

/// Collect the payload files of one extracted layer directory.
pub fn harvest_layer(
    layer_path: &Path,
    size: i64,
    max_file_size: i64,
    ingest: &dyn PackageIngest,
    apps: &dyn AppScanner,
) -> Result<LayerFiles> {
    let path_map = selective_files_from_path(layer_path, max_file_size, |rel, full| {
        if rel == EXTRACT_SENTINEL {
            return false;
        }
        pkg::is_os_pkg_file(rel)
            || apps.is_app_pkg_file(rel, full)
            || rel.starts_with(pkg::DPKG_STATUS_DIR)
            || (rel.starts_with(pkg::CONTENT_MANIFEST_DIR) && rel.ends_with(".json"))
            || rel.starts_with(pkg::DOCKERFILE_PREFIX)
    })
    .map_err(|err| ScanError::Package(err.to_string()))?;

    let mut files = LayerFiles {
        size,
        ..Default::default()
    };

    for (rel, full) in &path_map {
        let data = if pkg::is_rpm_pkg_file(rel) {
            match ingest.rpm_packages(full) {
                Ok(data) => data,
                Err(err) => {
                    debug!(file = %rel, %err, "rpm ingest failed");
                    continue;
                }
            }
        } else if rel == pkg::DPKG_STATUS || rel.starts_with(pkg::DPKG_STATUS_DIR) {
            match ingest.dpkg_status(full) {
                Ok(data) => data,
                Err(err) => {
                    debug!(file = %rel, %err, "dpkg ingest failed");
                    continue;
                }
            }
        } else if apps.is_app_pkg_file(rel, full) {
            if let Some(packages) = apps.extract(rel, full) {
                files.apps.insert(rel.clone(), packages);
            }
            continue;
        } else {
            // files were selectively picked above; read them verbatim
            match fs::read(full) {
                Ok(data) => data,
                Err(err) => {
                    debug!(file = %rel, %err, "read failed");
                    continue;
                }
            }
        };

        files.pkgs.insert(rel.clone(), data);
    }

    Ok(files)
}
