//! Resolved base runtime image.

use crate::images::layout::OciImageLayout;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_spec::image::{ImageConfiguration, MediaType};
use std::fmt;
use std::path::PathBuf;

/// Where a base image was resolved from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BaseSource {
    /// Registry reference (as written) and the expanded reference it was pulled from
    Registry { reference: String, resolved: String },
    /// Local OCI image layout directory
    Layout(PathBuf),
}

impl fmt::Display for BaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseSource::Registry { resolved, .. } => f.write_str(resolved),
            BaseSource::Layout(path) => write!(f, "oci:{}", path.display()),
        }
    }
}

/// One base layer blob on local disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerRef {
    pub digest: String,
    pub diff_id: String,
    pub media_type: MediaType,
    pub size: u64,
    pub blob: PathBuf,
}

/// A pinned base image whose blobs are all present locally.
#[derive(Clone, Debug)]
pub struct BaseImage {
    pub source: BaseSource,
    pub manifest_digest: String,
    pub config: ImageConfiguration,
    pub layers: Vec<LayerRef>,
}

impl BaseImage {
    pub fn from_layout(layout: &OciImageLayout) -> BoxforgeResult<Self> {
        let diff_ids = layout.config().rootfs().diff_ids();
        let blobs = layout.layer_blobs()?;

        let layers = layout
            .manifest()
            .layers()
            .iter()
            .zip(diff_ids)
            .zip(blobs)
            .map(|((desc, diff_id), blob)| LayerRef {
                digest: desc.digest().to_string(),
                diff_id: diff_id.clone(),
                media_type: normalize_layer_media_type(&desc.media_type().to_string()),
                size: desc.size(),
                blob,
            })
            .collect();

        Ok(Self {
            source: BaseSource::Layout(layout.paths().root().to_path_buf()),
            manifest_digest: layout.manifest_digest().to_string(),
            config: layout.config().clone(),
            layers,
        })
    }

    pub fn layer_blobs(&self) -> Vec<PathBuf> {
        self.layers.iter().map(|l| l.blob.clone()).collect()
    }

    pub fn diff_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.diff_id.clone()).collect()
    }

    /// Fail unless every layer blob is still on disk.
    pub fn check_blobs(&self) -> BoxforgeResult<()> {
        for layer in &self.layers {
            if !layer.blob.exists() {
                return Err(BoxforgeError::Image(format!(
                    "Base layer {} missing at {}",
                    layer.digest,
                    layer.blob.display()
                )));
            }
        }
        Ok(())
    }
}

/// Map Docker schema 2 layer types onto their OCI equivalents, so the
/// produced manifest uses OCI types throughout.
pub fn normalize_layer_media_type(media_type: &str) -> MediaType {
    match media_type {
        "application/vnd.docker.image.rootfs.diff.tar.gzip" => MediaType::ImageLayerGzip,
        "application/vnd.docker.image.rootfs.diff.tar" => MediaType::ImageLayer,
        "application/vnd.oci.image.layer.v1.tar+gzip" => MediaType::ImageLayerGzip,
        "application/vnd.oci.image.layer.v1.tar+zstd" => MediaType::ImageLayerZstd,
        "application/vnd.oci.image.layer.v1.tar" => MediaType::ImageLayer,
        other => MediaType::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_layer_types_become_oci() {
        assert_eq!(
            normalize_layer_media_type("application/vnd.docker.image.rootfs.diff.tar.gzip"),
            MediaType::ImageLayerGzip
        );
        assert_eq!(
            normalize_layer_media_type("application/vnd.oci.image.layer.v1.tar"),
            MediaType::ImageLayer
        );
    }

    #[test]
    fn source_display() {
        let registry = BaseSource::Registry {
            reference: "python:3.12.4-slim".into(),
            resolved: "docker.io/library/python:3.12.4-slim".into(),
        };
        assert_eq!(registry.to_string(), "docker.io/library/python:3.12.4-slim");
        assert_eq!(
            BaseSource::Layout(PathBuf::from("/tmp/base")).to_string(),
            "oci:/tmp/base"
        );
    }
}
