//! Image tarball manifest resolution.
//!
//! An exported image tar carries a `manifest.json` describing the image
//! plus, per layer, a `<id>/layer.tar` blob and a `<id>/json` metadata
//! sidecar. This module pulls the manifest and sidecars into memory,
//! copies the layer tars out to disk, and flips the declared layer order
//! into the bottom-up view the history reconciler expects.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};
use layersift_core::error::{Result, ScanError};
use serde::Deserialize;
use tracing::error;

use crate::archive;

/// Image description file inside an exported image tar.
pub const MANIFEST_JSON: &str = "manifest.json";

const LAYER_JSON_SUFFIX: &str = "/json";
const LAYER_TAR_SUFFIX: &str = "_layer.tar";

/// Parsed `manifest.json` entry of an image tarball.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayerConfig {
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

/// Per-layer metadata sidecar (`<id>/json`).
#[derive(Debug, Clone, Deserialize)]
pub struct LayerMetadata {
    pub id: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: LayerConfig,
}

/// Layer identity and build metadata recovered from an image tarball,
/// ordered bottom-up (index 0 = oldest layer).
#[derive(Debug, Default)]
pub struct TarLayout {
    /// In-tarball layer directory IDs
    pub layer_ids: Vec<String>,
    /// Space-joined layer commands
    pub cmds: Vec<String>,
    /// Environment strings accumulated across layers
    pub envs: Vec<String>,
    /// Labels merged across layers
    pub labels: HashMap<String, String>,
}

/// Resolve an exported image tar: copy each `layer.tar` into `tmp_dir`
/// and return the bottom-up layer layout.
///
/// The tar is read twice; the first pass keeps only the manifest and the
/// small JSON sidecars in memory, bounded by `max_file_size`.
pub fn resolve_image_tar(tmp_dir: &Path, image_tar: &Path, max_file_size: i64) -> Result<TarLayout> {
    let reader = BufReader::new(File::open(image_tar)?);
    let files = archive::extract_to_memory(
        reader,
        |name| name == MANIFEST_JSON || name.ends_with(LAYER_JSON_SUFFIX),
        max_file_size,
    )?;

    let data = files
        .get(MANIFEST_JSON)
        .ok_or_else(|| ScanError::Package("can not locate the manifest.json in image".to_string()))?;
    let manifests: Vec<ImageManifest> = serde_json::from_slice(data)?;
    let Some(manifest) = manifests.first() else {
        return Err(ScanError::Package("can not extract layer from the image".to_string()));
    };

    let reader = BufReader::new(File::open(image_tar)?);
    let file_map = archive::extract_to_disk(
        reader,
        |name| manifest.layers.iter().any(|l| l == name),
        tmp_dir,
    )?;

    let count = manifest.layers.len();
    let mut layout = TarLayout {
        layer_ids: vec![String::new(); count],
        cmds: vec![String::new(); count],
        ..Default::default()
    };

    for (i, layer_tar) in manifest.layers.iter().enumerate() {
        let tar_path = file_map.get(layer_tar).ok_or_else(|| {
            error!(layer = %layer_tar, "could not find the image layer");
            ScanError::Package(format!("could not find the image layer: {}", layer_tar))
        })?;
        let json_name = layer_tar.replace("layer.tar", "json");
        let json_data = files.get(&json_name).ok_or_else(|| {
            error!(file = %json_name, "could not find the layer json file");
            ScanError::Package(format!("could not find the layer json file: {}", json_name))
        })?;
        let meta: LayerMetadata = serde_json::from_slice(json_data)?;

        let file_name = tar_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = file_name
            .strip_suffix(LAYER_TAR_SUFFIX)
            .unwrap_or(&file_name)
            .to_string();

        // the manifest lists layers in the opposite order of the history
        layout.layer_ids[count - i - 1] = id;
        layout.cmds[count - i - 1] = meta.config.cmd.join(" ");
        layout.envs.extend(meta.config.env);
        layout.labels.extend(meta.config.labels);
    }

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{append_file, build_image_tar};
    use tempfile::TempDir;

    fn write_tar(dir: &Path, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join("image.tar");
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_resolve_reverses_layer_order() {
        let tmp = TempDir::new().unwrap();
        // manifest order: newest first; resolved order: oldest first
        let tar = build_image_tar(
            &[
                ("top", b"top-bytes", r#"["echo","run"]"#),
                ("base", b"base-bytes", r#"["sh"]"#),
            ],
            &["top/layer.tar", "base/layer.tar"],
        );
        let image_tar = write_tar(tmp.path(), &tar);

        let layout = resolve_image_tar(tmp.path(), &image_tar, 1024 * 1024).unwrap();

        assert_eq!(layout.layer_ids, vec!["base", "top"]);
        assert_eq!(layout.cmds, vec!["sh", "echo run"]);
        assert_eq!(layout.envs, vec!["A=1", "A=1"]);
        assert_eq!(layout.labels["maintainer"], "demo");

        // the layer tars landed on disk under their flattened names
        assert_eq!(
            std::fs::read(tmp.path().join("top_layer.tar")).unwrap(),
            b"top-bytes"
        );
        assert_eq!(
            std::fs::read(tmp.path().join("base_layer.tar")).unwrap(),
            b"base-bytes"
        );
    }

    #[test]
    fn test_resolve_round_trip_order() {
        let tmp = TempDir::new().unwrap();
        let ids = ["c", "b", "a"];
        let tar = build_image_tar(
            &[
                ("c", b"c", r#"["c"]"#),
                ("b", b"b", r#"["b"]"#),
                ("a", b"a", r#"["a"]"#),
            ],
            &["c/layer.tar", "b/layer.tar", "a/layer.tar"],
        );
        let image_tar = write_tar(tmp.path(), &tar);

        let layout = resolve_image_tar(tmp.path(), &image_tar, 1024).unwrap();

        // reversing the resolved order reconstructs the declared order
        let mut declared: Vec<String> = layout.layer_ids.clone();
        declared.reverse();
        assert_eq!(declared, ids.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    }

    #[test]
    fn test_resolve_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, "something/else", b"x");
        let image_tar = write_tar(tmp.path(), &builder.into_inner().unwrap());

        let err = resolve_image_tar(tmp.path(), &image_tar, 1024).unwrap_err();
        assert!(matches!(err, ScanError::Package(_)));
    }

    #[test]
    fn test_resolve_empty_manifest_array() {
        let tmp = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        append_file(&mut builder, MANIFEST_JSON, b"[]");
        let image_tar = write_tar(tmp.path(), &builder.into_inner().unwrap());

        let err = resolve_image_tar(tmp.path(), &image_tar, 1024).unwrap_err();
        assert!(matches!(err, ScanError::Package(_)));
    }

    #[test]
    fn test_resolve_missing_sidecar() {
        let tmp = TempDir::new().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        append_file(
            &mut builder,
            MANIFEST_JSON,
            br#"[{"Config":"cfg.json","Layers":["aaa/layer.tar"]}]"#,
        );
        append_file(&mut builder, "aaa/layer.tar", b"bytes");
        let image_tar = write_tar(tmp.path(), &builder.into_inner().unwrap());

        let err = resolve_image_tar(tmp.path(), &image_tar, 1024).unwrap_err();
        assert!(matches!(err, ScanError::Package(_)));
    }

    #[test]
    fn test_layer_metadata_parsing() {
        let json = r#"{
            "id": "deadbeef",
            "parent": "cafebabe",
            "created": "2024-05-01T12:30:00Z",
            "config": {"Cmd": ["/bin/sh"], "Env": ["PATH=/usr/bin"], "Labels": {"k": "v"}}
        }"#;
        let meta: LayerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.id, "deadbeef");
        assert_eq!(meta.parent.as_deref(), Some("cafebabe"));
        assert!(meta.created.is_some());
        assert_eq!(meta.config.cmd, vec!["/bin/sh"]);
    }

    #[test]
    fn test_manifest_parsing_defaults() {
        let m: Vec<ImageManifest> =
            serde_json::from_str(r#"[{"Config":"c.json","Layers":["x/layer.tar"]}]"#).unwrap();
        assert!(m[0].repo_tags.is_empty());
        assert_eq!(m[0].layers, vec!["x/layer.tar"]);
    }
}
