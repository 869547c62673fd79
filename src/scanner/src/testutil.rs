//! Tar-building helpers shared by the module tests.

use crate::manifest::MANIFEST_JSON;

pub(crate) fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, content: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, content).unwrap();
}

/// Plain tar archive with the given regular files.
pub(crate) fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        append_file(&mut builder, name, content);
    }
    builder.into_inner().unwrap()
}

/// Exported-image tar: `manifest.json` plus, per layer, a `<id>/json`
/// sidecar and a `<id>/layer.tar` blob. `layers` entries are
/// `(id, layer tar bytes, JSON Cmd array)`.
pub(crate) fn build_image_tar(layers: &[(&str, &[u8], &str)], manifest_layers: &[&str]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let manifest = format!(
        r#"[{{"Config":"cfg.json","RepoTags":["demo:latest"],"Layers":[{}]}}]"#,
        manifest_layers
            .iter()
            .map(|l| format!("\"{}\"", l))
            .collect::<Vec<_>>()
            .join(",")
    );
    append_file(&mut builder, MANIFEST_JSON, manifest.as_bytes());

    for (id, content, cmd) in layers {
        let json = format!(
            r#"{{"id":"{}","created":"2024-05-01T00:00:00Z","config":{{"Cmd":{},"Env":["A=1"],"Labels":{{"maintainer":"demo"}}}}}}"#,
            id, cmd
        );
        append_file(&mut builder, &format!("{}/json", id), json.as_bytes());
        append_file(&mut builder, &format!("{}/layer.tar", id), content);
    }

    builder.into_inner().unwrap()
}
