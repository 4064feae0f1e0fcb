//! OCI image layout directories: reading base images and writing results.

use crate::images::archive::{self, UnpackStats};
use crate::images::host_platform;
use boxforge_shared::OciLayoutPaths;
use boxforge_shared::constants::oci::ANNOTATION_REF_NAME;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageConfiguration, ImageIndex, ImageIndexBuilder,
    ImageManifest, MediaType,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// READER
// ============================================================================

/// A loaded OCI image layout with one selected image.
#[derive(Debug, Clone)]
pub struct OciImageLayout {
    paths: OciLayoutPaths,
    manifest_digest: String,
    manifest: ImageManifest,
    config: ImageConfiguration,
    ref_name: Option<String>,
}

impl OciImageLayout {
    /// Open the layout at `root`, selecting the single image it contains
    /// (or the one for the host platform).
    pub fn open(root: &Path) -> BoxforgeResult<Self> {
        Self::open_ref(root, None)
    }

    /// Open the layout at `root`, selecting the image tagged `ref_name`.
    pub fn open_ref(root: &Path, ref_name: Option<&str>) -> BoxforgeResult<Self> {
        let paths = OciLayoutPaths::new(root);

        let index_path = paths.index_file();
        if !index_path.exists() {
            return Err(BoxforgeError::Image(format!(
                "OCI image layout must contain index.json, not found at: {}",
                index_path.display()
            )));
        }

        let index: ImageIndex = read_json(&index_path, "index.json")?;
        let descriptor = select_manifest(&paths, &index, ref_name)?;
        let selected_ref = descriptor
            .annotations()
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .cloned();

        let manifest_digest = descriptor.digest().to_string();
        let manifest_path = existing_blob(&paths, &manifest_digest)?;
        let manifest: ImageManifest = read_json(&manifest_path, "manifest")?;

        let config_digest = manifest.config().digest().to_string();
        let config_path = existing_blob(&paths, &config_digest)?;
        let config: ImageConfiguration = read_json(&config_path, "image config")?;

        for layer in manifest.layers() {
            existing_blob(&paths, &layer.digest().to_string())?;
        }

        if manifest.layers().len() != config.rootfs().diff_ids().len() {
            return Err(BoxforgeError::Image(format!(
                "Manifest {} lists {} layers but its config has {} diff_ids",
                manifest_digest,
                manifest.layers().len(),
                config.rootfs().diff_ids().len()
            )));
        }

        tracing::debug!(
            root = %root.display(),
            manifest = %manifest_digest,
            layers = manifest.layers().len(),
            "Opened OCI image layout"
        );

        Ok(Self {
            paths,
            manifest_digest,
            manifest,
            config,
            ref_name: selected_ref,
        })
    }

    pub fn paths(&self) -> &OciLayoutPaths {
        &self.paths
    }

    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.ref_name.as_deref()
    }

    /// Layer blob paths, bottom to top.
    pub fn layer_blobs(&self) -> BoxforgeResult<Vec<PathBuf>> {
        self.manifest
            .layers()
            .iter()
            .map(|l| existing_blob(&self.paths, &l.digest().to_string()))
            .collect()
    }

    /// Flatten the image into `dest`.
    pub fn unpack(&self, dest: &Path) -> BoxforgeResult<UnpackStats> {
        archive::unpack_layers(&self.layer_blobs()?, dest)
    }
}

fn select_manifest(
    paths: &OciLayoutPaths,
    index: &ImageIndex,
    ref_name: Option<&str>,
) -> BoxforgeResult<Descriptor> {
    let manifests = index.manifests();
    if manifests.is_empty() {
        return Err(BoxforgeError::Image("No manifests in index.json".into()));
    }

    let chosen = if let Some(wanted) = ref_name {
        manifests
            .iter()
            .find(|m| {
                m.annotations()
                    .as_ref()
                    .and_then(|a| a.get(ANNOTATION_REF_NAME))
                    .is_some_and(|r| r == wanted)
            })
            .ok_or_else(|| {
                BoxforgeError::Image(format!("No image tagged '{}' in index.json", wanted))
            })?
    } else if manifests.len() == 1 {
        &manifests[0]
    } else {
        let (os, arch) = host_platform();
        manifests
            .iter()
            .find(|m| {
                m.platform().as_ref().is_some_and(|p| {
                    p.os().to_string() == os && p.architecture().to_string() == arch
                })
            })
            .ok_or_else(|| {
                BoxforgeError::Image(format!(
                    "index.json lists {} images and none is tagged or built for {}/{}",
                    manifests.len(),
                    os,
                    arch
                ))
            })?
    };

    // Nested index (e.g. a multi-platform image stored under one tag).
    if *chosen.media_type() == MediaType::ImageIndex {
        let nested_path = existing_blob(paths, &chosen.digest().to_string())?;
        let nested: ImageIndex = read_json(&nested_path, "nested index")?;
        let mut inner = select_manifest(paths, &nested, None)?;
        if let Some(annotations) = chosen.annotations() {
            inner.set_annotations(Some(annotations.clone()));
        }
        return Ok(inner);
    }

    Ok(chosen.clone())
}

fn existing_blob(paths: &OciLayoutPaths, digest: &str) -> BoxforgeResult<PathBuf> {
    let path = paths
        .blob_path(digest)
        .ok_or_else(|| BoxforgeError::Image(format!("Unsupported blob digest: {}", digest)))?;
    if !path.exists() {
        return Err(BoxforgeError::Image(format!(
            "Blob {} missing from layout {}",
            digest,
            paths.root().display()
        )));
    }
    Ok(path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> BoxforgeResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BoxforgeError::Image(format!("Failed to read {}: {}", what, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| BoxforgeError::Image(format!("Failed to parse {}: {}", what, e)))
}

// ============================================================================
// WRITER
// ============================================================================

/// Writes blobs and the index of a new image layout.
#[derive(Debug, Clone)]
pub struct LayoutWriter {
    paths: OciLayoutPaths,
}

impl LayoutWriter {
    /// Prepare an empty layout at `root`.
    pub fn create(root: &Path) -> BoxforgeResult<Self> {
        let paths = OciLayoutPaths::new(root);
        paths.prepare().map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to prepare image layout {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &OciLayoutPaths {
        &self.paths
    }

    /// Serialise `value` canonically and store it as a blob.
    pub fn write_json_blob<T: Serialize>(
        &self,
        value: &T,
        media_type: MediaType,
    ) -> BoxforgeResult<Descriptor> {
        let bytes = canonical_json(value)?;
        self.write_blob(&bytes, media_type)
    }

    pub fn write_blob(&self, bytes: &[u8], media_type: MediaType) -> BoxforgeResult<Descriptor> {
        let digest = archive::sha256_bytes(bytes);
        let path = self.blob_path(&digest)?;
        if !path.exists() {
            std::fs::write(&path, bytes).map_err(|e| {
                BoxforgeError::Storage(format!("Failed to write blob {}: {}", path.display(), e))
            })?;
        }
        descriptor(media_type, &digest, bytes.len() as u64, None)
    }

    /// Copy an existing blob (e.g. a base layer) into this layout.
    pub fn import_blob(&self, src: &Path, digest: &str) -> BoxforgeResult<()> {
        let dst = self.blob_path(digest)?;
        if dst.exists() {
            return Ok(());
        }
        // Same filesystem is the common case; fall back to a copy.
        if std::fs::hard_link(src, &dst).is_err() {
            std::fs::copy(src, &dst).map_err(|e| {
                BoxforgeError::Storage(format!(
                    "Failed to copy blob {} -> {}: {}",
                    src.display(),
                    dst.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Write `index.json` pointing at one manifest.
    pub fn write_index(&self, manifest: Descriptor, ref_name: Option<&str>) -> BoxforgeResult<()> {
        let manifest = match ref_name {
            Some(name) => {
                let mut annotations = HashMap::new();
                annotations.insert(ANNOTATION_REF_NAME.to_string(), name.to_string());
                descriptor(
                    manifest.media_type().clone(),
                    &manifest.digest().to_string(),
                    manifest.size(),
                    Some(annotations),
                )?
            }
            None => manifest,
        };

        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![manifest])
            .build()
            .map_err(|e| BoxforgeError::Internal(format!("Failed to build image index: {}", e)))?;

        let bytes = canonical_json(&index)?;
        let path = self.paths.index_file();
        std::fs::write(&path, bytes).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    fn blob_path(&self, digest: &str) -> BoxforgeResult<PathBuf> {
        self.paths
            .blob_path(digest)
            .ok_or_else(|| BoxforgeError::Internal(format!("Invalid blob digest: {}", digest)))
    }
}

/// Build a descriptor from a `sha256:<hex>` digest string.
pub fn descriptor(
    media_type: MediaType,
    digest: &str,
    size: u64,
    annotations: Option<HashMap<String, String>>,
) -> BoxforgeResult<Descriptor> {
    let digest = Digest::from_str(digest)
        .map_err(|e| BoxforgeError::Internal(format!("Invalid digest '{}': {}", digest, e)))?;
    let builder = DescriptorBuilder::default()
        .media_type(media_type)
        .digest(digest)
        .size(size);
    let builder = match annotations {
        Some(a) => builder.annotations(a),
        None => builder,
    };
    builder
        .build()
        .map_err(|e| BoxforgeError::Internal(format!("Failed to build descriptor: {}", e)))
}

/// JSON with object keys sorted at every level, so equal values always
/// serialise to equal bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> BoxforgeResult<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| BoxforgeError::Internal(format!("Failed to serialize JSON: {}", e)))?;
    serde_json::to_vec(&sort_keys(value))
        .map_err(|e| BoxforgeError::Internal(format!("Failed to serialize JSON: {}", e)))
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let mut labels = HashMap::new();
        labels.insert("zeta", 1);
        labels.insert("alpha", 2);
        let value = serde_json::json!({"b": {"y": 1, "x": 2}, "a": labels});

        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"alpha":2,"zeta":1},"b":{"x":2,"y":1}}"#
        );
    }

    #[test]
    fn writer_stores_content_addressed_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LayoutWriter::create(dir.path()).unwrap();

        let desc = writer.write_blob(b"{}", MediaType::ImageConfig).unwrap();
        assert_eq!(desc.size(), 2);
        assert_eq!(desc.digest().to_string(), archive::sha256_bytes(b"{}"));
        assert!(writer.paths().blob_path(&desc.digest().to_string()).unwrap().exists());
        assert!(dir.path().join("oci-layout").exists());
    }

    #[test]
    fn index_carries_ref_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LayoutWriter::create(dir.path()).unwrap();
        let desc = writer.write_blob(b"manifest", MediaType::ImageManifest).unwrap();

        writer.write_index(desc, Some("demo:1.0")).unwrap();

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("index.json")).unwrap()).unwrap();
        assert_eq!(index["schemaVersion"], 2);
        assert_eq!(
            index["manifests"][0]["annotations"][ANNOTATION_REF_NAME],
            "demo:1.0"
        );
    }

    #[test]
    fn open_reports_missing_index() {
        let dir = tempfile::tempdir().unwrap();
        let err = OciImageLayout::open(dir.path()).unwrap_err();
        assert!(matches!(err, BoxforgeError::Image(_)));
    }
}
