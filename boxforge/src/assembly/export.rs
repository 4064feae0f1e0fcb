//! Image export.
//!
//! Packs the new layers, writes config, manifest and index into a staging
//! layout next to the output, then swaps it into place with renames. A
//! failed export never touches what is at the output path.

use crate::assembly::types::LayerStep;
use crate::images::archive::{PackedLayer, is_empty_layer, pack_layers};
use crate::images::{
    BaseImage, BaseSource, HistoryEntry, LayoutWriter, RuntimeSettings, apply_runtime_settings,
    descriptor,
};
use boxforge_shared::OciLayoutPaths;
use boxforge_shared::constants::oci::{ANNOTATION_BASE_DIGEST, ANNOTATION_BASE_NAME};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_spec::image::{ImageManifestBuilder, MediaType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct ExportInput<'a> {
    pub base: &'a BaseImage,
    /// Every layer step, bottom to top; empty ones are skipped
    pub layers: &'a [LayerStep],
    pub settings: &'a RuntimeSettings,
    /// Trailing history entry for the entry command
    pub entry_history: &'a HistoryEntry,
    pub staging: &'a Path,
    pub output: &'a Path,
    pub tag: Option<&'a str>,
    pub source_date_epoch: u64,
}

/// What was written.
#[derive(Clone, Debug)]
pub struct ExportOutput {
    pub manifest_digest: String,
    pub config_digest: String,
    pub base_layers: usize,
    pub new_layers: Vec<PackedLayer>,
}

pub fn run(input: ExportInput<'_>) -> BoxforgeResult<ExportOutput> {
    let writer = LayoutWriter::create(input.staging)?;

    for layer in &input.base.layers {
        writer.import_blob(&layer.blob, &layer.digest)?;
    }

    let (history, kept): (Vec<HistoryEntry>, Vec<PathBuf>) = plan_layers(input.layers);
    let packed = pack_layers(&kept, writer.paths(), input.source_date_epoch)?;

    let mut diff_ids = input.base.diff_ids();
    diff_ids.extend(packed.iter().map(|p| p.diff_id.clone()));

    let mut history = history;
    history.push(input.entry_history.clone());

    let config = apply_runtime_settings(&input.base.config, input.settings, diff_ids, &history)?;
    let config_desc = writer.write_json_blob(&config, MediaType::ImageConfig)?;

    let mut layer_descs = Vec::with_capacity(input.base.layers.len() + packed.len());
    for layer in &input.base.layers {
        layer_descs.push(descriptor(
            layer.media_type.clone(),
            &layer.digest,
            layer.size,
            None,
        )?);
    }
    for layer in &packed {
        layer_descs.push(descriptor(
            MediaType::ImageLayerGzip,
            &layer.digest,
            layer.size,
            None,
        )?);
    }

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_desc.clone())
        .layers(layer_descs)
        .annotations(base_annotations(input.base))
        .build()
        .map_err(|e| BoxforgeError::Internal(format!("Failed to build image manifest: {}", e)))?;

    let manifest_desc = writer.write_json_blob(&manifest, MediaType::ImageManifest)?;
    let manifest_digest = manifest_desc.digest().to_string();
    writer.write_index(manifest_desc, input.tag)?;

    publish(input.staging, input.output)?;

    tracing::info!(
        output = %input.output.display(),
        manifest = %manifest_digest,
        base_layers = input.base.layers.len(),
        new_layers = packed.len(),
        "Image written"
    );

    Ok(ExportOutput {
        manifest_digest,
        config_digest: config_desc.digest().to_string(),
        base_layers: input.base.layers.len(),
        new_layers: packed,
    })
}

/// History entries for every step, and the directories of non-empty layers.
fn plan_layers(layers: &[LayerStep]) -> (Vec<HistoryEntry>, Vec<PathBuf>) {
    let mut history = Vec::with_capacity(layers.len());
    let mut kept = Vec::new();
    for layer in layers {
        let empty = is_empty_layer(&layer.dir);
        if empty {
            tracing::debug!(step = layer.name, "Layer is empty, omitted from the image");
        } else {
            kept.push(layer.dir.clone());
        }
        history.push(HistoryEntry {
            created_by: layer.created_by.clone(),
            comment: layer.comment.clone(),
            empty_layer: empty,
        });
    }
    (history, kept)
}

fn base_annotations(base: &BaseImage) -> HashMap<String, String> {
    let mut annotations = HashMap::new();
    annotations.insert(
        ANNOTATION_BASE_DIGEST.to_string(),
        base.manifest_digest.clone(),
    );
    // Layout bases are named by a host path, which would leak into the digest.
    if let BaseSource::Registry { reference, .. } = &base.source {
        annotations.insert(ANNOTATION_BASE_NAME.to_string(), reference.clone());
    }
    annotations
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Fail unless `output` is free, empty, or an earlier image layout.
///
/// Run before any assembly step so a bad output path costs nothing.
pub fn check_output(output: &Path) -> BoxforgeResult<()> {
    if !output.exists() {
        return Ok(());
    }
    if !output.is_dir() {
        return Err(BoxforgeError::Config(format!(
            "Output path {} exists and is not a directory",
            output.display()
        )));
    }

    let is_layout = OciLayoutPaths::new(output).oci_layout_file().is_file();
    let is_empty = std::fs::read_dir(output)
        .map_err(|e| {
            BoxforgeError::Storage(format!("Failed to read {}: {}", output.display(), e))
        })?
        .next()
        .is_none();

    if !is_layout && !is_empty {
        return Err(BoxforgeError::Config(format!(
            "Output path {} is a non-empty directory that does not hold an OCI image",
            output.display()
        )));
    }
    Ok(())
}

/// Staging directory for `output`: a hidden sibling, so the final rename
/// stays on one filesystem.
pub fn staging_path(output: &Path, build_id: &str) -> BoxforgeResult<PathBuf> {
    let name = output
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            BoxforgeError::Config(format!("Output path {} has no file name", output.display()))
        })?;
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.{}.partial", name, build_id.to_lowercase())))
}

/// Move `staging` to `output`, replacing an earlier image there.
fn publish(staging: &Path, output: &Path) -> BoxforgeResult<()> {
    check_output(output)?;

    if !output.exists() {
        return rename(staging, output);
    }

    let mut backup = staging.as_os_str().to_owned();
    backup.push(".old");
    let backup = PathBuf::from(backup);

    rename(output, &backup)?;
    if let Err(e) = rename(staging, output) {
        if let Err(restore) = std::fs::rename(&backup, output) {
            tracing::error!(
                backup = %backup.display(),
                "Failed to restore previous image: {}",
                restore
            );
        }
        return Err(e);
    }

    if let Err(e) = std::fs::remove_dir_all(&backup) {
        tracing::warn!(path = %backup.display(), "Failed to remove previous image: {}", e);
    }
    Ok(())
}

fn rename(from: &Path, to: &Path) -> BoxforgeResult<()> {
    std::fs::rename(from, to).map_err(|e| {
        BoxforgeError::Storage(format!(
            "Failed to move {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_is_hidden_sibling() {
        let staging = staging_path(Path::new("/out/app-image"), "01HXYZ").unwrap();
        assert_eq!(staging, PathBuf::from("/out/.app-image.01hxyz.partial"));
        assert!(staging_path(Path::new("/"), "01HXYZ").is_err());
    }

    #[test]
    fn output_checks() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("image");
        check_output(&out).unwrap();

        std::fs::create_dir(&out).unwrap();
        check_output(&out).unwrap();

        std::fs::write(out.join("notes.txt"), "keep me").unwrap();
        assert!(check_output(&out).unwrap_err().is_user_error());

        std::fs::write(out.join("oci-layout"), "{}").unwrap();
        check_output(&out).unwrap();

        let file = dir.path().join("file");
        std::fs::write(&file, "").unwrap();
        assert!(check_output(&file).unwrap_err().is_user_error());
    }

    #[test]
    fn publish_replaces_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("image");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("oci-layout"), "old").unwrap();

        let staging = staging_path(&out, "01ABC").unwrap();
        std::fs::create_dir(&staging).unwrap();
        std::fs::write(staging.join("oci-layout"), "new").unwrap();

        publish(&staging, &out).unwrap();

        assert_eq!(std::fs::read_to_string(out.join("oci-layout")).unwrap(), "new");
        assert!(!staging.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn empty_layers_are_recorded_but_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("full");
        let empty = dir.path().join("empty");
        std::fs::create_dir_all(full.join("src")).unwrap();
        std::fs::write(full.join("src/main.py"), "").unwrap();
        std::fs::create_dir_all(&empty).unwrap();

        let steps = [
            LayerStep {
                name: "source",
                dir: full.clone(),
                created_by: "boxforge: COPY src /src".into(),
                comment: None,
            },
            LayerStep {
                name: "env_files",
                dir: empty,
                created_by: "boxforge: COPY .env* /".into(),
                comment: Some("no matching files".into()),
            },
        ];

        let (history, kept) = plan_layers(&steps);
        assert_eq!(kept, vec![full]);
        assert!(!history[0].empty_layer);
        assert!(history[1].empty_layer);
    }
}
