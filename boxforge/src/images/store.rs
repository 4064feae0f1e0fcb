//! Registry-backed base image cache.
//!
//! `ImageStore` resolves a pinned reference to a `BaseImage` whose blobs are
//! on local disk. The local index is consulted first; on a miss the image is
//! pulled with `oci_client`, every blob staged and verified before it is
//! committed, and the index updated last.

use crate::images::base::{BaseImage, BaseSource, LayerRef, normalize_layer_media_type};
use crate::images::index::{CachedImage, ImageIndex};
use crate::images::storage::ImageStorage;
use crate::images::{PinnedReference, ReferenceIter, host_platform};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_client::Reference;
use oci_client::manifest::{OciDescriptor, OciImageIndex, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_spec::image::ImageConfiguration;
use std::path::PathBuf;
use tokio::sync::RwLock;

const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Layer as listed in a registry manifest.
#[derive(Clone, Debug)]
struct RemoteLayer {
    digest: String,
    media_type: String,
}

/// Platform manifest resolved from the registry.
#[derive(Clone, Debug)]
struct ResolvedManifest {
    manifest_digest: String,
    config_digest: String,
    layers: Vec<RemoteLayer>,
}

struct ImageStoreInner {
    index: ImageIndex,
    storage: ImageStorage,
}

/// Thread-safe cache of pulled base images.
pub struct ImageStore {
    client: oci_client::Client,
    registries: Vec<String>,
    inner: RwLock<ImageStoreInner>,
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("registries", &self.registries)
            .finish()
    }
}

impl ImageStore {
    /// Open the cache at `images_dir`. Unqualified references are tried
    /// against `registries` in order (docker.io when empty).
    pub fn new(images_dir: PathBuf, registries: Vec<String>) -> BoxforgeResult<Self> {
        let storage = ImageStorage::new(images_dir.clone())?;
        let index = ImageIndex::load(&images_dir);
        Ok(Self {
            client: oci_client::Client::new(Default::default()),
            registries,
            inner: RwLock::new(ImageStoreInner { index, storage }),
        })
    }

    /// Resolve `reference`, pulling it on a cache miss.
    pub async fn pull(&self, reference: &PinnedReference) -> BoxforgeResult<BaseImage> {
        {
            let inner = self.inner.read().await;
            if let Some(image) = self.try_load_cached(&inner, reference.as_str())? {
                tracing::info!(image = %reference, "Using cached base image");
                return Ok(image);
            }
        }

        let candidates = ReferenceIter::new(reference.as_str(), &self.registries).map_err(|e| {
            BoxforgeError::Config(format!("Invalid base image reference '{}': {}", reference, e))
        })?;

        let mut errors = Vec::new();
        for candidate in candidates {
            tracing::info!(image = %candidate.whole(), "Pulling base image from registry");
            match self.pull_from_registry(reference.as_str(), &candidate).await {
                Ok(image) => return Ok(image),
                Err(e) => {
                    tracing::warn!(image = %candidate.whole(), error = %e, "Pull failed");
                    errors.push(format!("{}: {}", candidate.whole(), e));
                }
            }
        }

        Err(BoxforgeError::Image(format!(
            "Failed to resolve base image '{}': {}",
            reference,
            errors.join("; ")
        )))
    }

    /// Cached image for `reference`, if complete and intact.
    pub async fn cached(&self, reference: &str) -> BoxforgeResult<Option<BaseImage>> {
        let inner = self.inner.read().await;
        self.try_load_cached(&inner, reference)
    }

    // ========================================================================
    // INTERNAL: Cache
    // ========================================================================

    fn try_load_cached(
        &self,
        inner: &ImageStoreInner,
        reference: &str,
    ) -> BoxforgeResult<Option<BaseImage>> {
        let cached = match inner.index.get(reference) {
            Some(c) if c.complete => c.clone(),
            _ => {
                tracing::debug!(image = %reference, "Image not cached or incomplete");
                return Ok(None);
            }
        };

        let mut all = cached.layers.clone();
        all.push(cached.config_digest.clone());
        if !inner.storage.has_manifest(&cached.manifest_digest)
            || !inner.storage.verify_blobs_exist(&all)
        {
            tracing::warn!(image = %reference, "Cached image files missing, will re-download");
            return Ok(None);
        }

        let layers = match inner.storage.load_manifest(&cached.manifest_digest)? {
            OciManifest::Image(ref img) => Self::layers_from_image(img),
            OciManifest::ImageIndex(_) => {
                return Err(BoxforgeError::Storage(
                    "Cached manifest is not a platform image".into(),
                ));
            }
        };

        let resolved = ResolvedManifest {
            manifest_digest: cached.manifest_digest,
            config_digest: cached.config_digest,
            layers,
        };
        self.base_image(&inner.storage, reference, &cached.resolved, &resolved)
            .map(Some)
    }

    fn base_image(
        &self,
        storage: &ImageStorage,
        reference: &str,
        resolved_ref: &str,
        resolved: &ResolvedManifest,
    ) -> BoxforgeResult<BaseImage> {
        let config_path = storage.blob_path(&resolved.config_digest)?;
        let config_json = std::fs::read_to_string(&config_path).map_err(|e| {
            BoxforgeError::Storage(format!(
                "Failed to read config {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let config: ImageConfiguration = serde_json::from_str(&config_json)
            .map_err(|e| BoxforgeError::Image(format!("Failed to parse image config: {}", e)))?;

        let diff_ids = config.rootfs().diff_ids();
        if diff_ids.len() != resolved.layers.len() {
            return Err(BoxforgeError::Image(format!(
                "Manifest {} lists {} layers but its config has {} diff_ids",
                resolved.manifest_digest,
                resolved.layers.len(),
                diff_ids.len()
            )));
        }

        let mut layers = Vec::with_capacity(resolved.layers.len());
        for (layer, diff_id) in resolved.layers.iter().zip(diff_ids) {
            let blob = storage.blob_path(&layer.digest)?;
            let size = std::fs::metadata(&blob)
                .map_err(|e| {
                    BoxforgeError::Storage(format!("Failed to stat {}: {}", blob.display(), e))
                })?
                .len();
            layers.push(LayerRef {
                digest: layer.digest.clone(),
                diff_id: diff_id.clone(),
                media_type: normalize_layer_media_type(&layer.media_type),
                size,
                blob,
            });
        }

        Ok(BaseImage {
            source: BaseSource::Registry {
                reference: reference.to_string(),
                resolved: resolved_ref.to_string(),
            },
            manifest_digest: resolved.manifest_digest.clone(),
            config,
            layers,
        })
    }

    // ========================================================================
    // INTERNAL: Registry
    // ========================================================================

    async fn pull_from_registry(
        &self,
        image_ref: &str,
        reference: &Reference,
    ) -> BoxforgeResult<BaseImage> {
        let (manifest, manifest_digest) = self
            .client
            .pull_manifest(reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| BoxforgeError::Image(format!("Failed to pull manifest: {e}")))?;

        {
            let inner = self.inner.read().await;
            inner.storage.save_manifest(&manifest, &manifest_digest)?;
        }

        let resolved = match manifest {
            OciManifest::Image(ref img) => ResolvedManifest {
                manifest_digest,
                config_digest: img.config.digest.clone(),
                layers: Self::layers_from_image(img),
            },
            OciManifest::ImageIndex(ref index) => {
                self.pull_platform_manifest(reference, index).await?
            }
        };

        self.download_layers(reference, &resolved.layers).await?;
        self.download_blob(reference, &resolved.config_digest, CONFIG_MEDIA_TYPE)
            .await?;

        let mut inner = self.inner.write().await;
        let image = self.base_image(&inner.storage, image_ref, &reference.whole(), &resolved)?;

        inner.index.upsert(
            image_ref.to_string(),
            CachedImage {
                resolved: reference.whole(),
                manifest_digest: resolved.manifest_digest.clone(),
                config_digest: resolved.config_digest.clone(),
                layers: resolved.layers.iter().map(|l| l.digest.clone()).collect(),
                cached_at: chrono::Utc::now().to_rfc3339(),
                complete: true,
            },
        );
        if let Err(e) = inner.index.save(inner.storage.images_dir()) {
            tracing::warn!(error = %e, "Failed to save image index");
        }

        tracing::info!(
            image = %reference.whole(),
            manifest = %resolved.manifest_digest,
            layers = resolved.layers.len(),
            "Base image cached"
        );
        Ok(image)
    }

    fn layers_from_image(image: &OciImageManifest) -> Vec<RemoteLayer> {
        image
            .layers
            .iter()
            .map(|layer| RemoteLayer {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
            })
            .collect()
    }

    async fn pull_platform_manifest(
        &self,
        reference: &Reference,
        index: &OciImageIndex,
    ) -> BoxforgeResult<ResolvedManifest> {
        let (os, arch) = host_platform();
        let entry = index
            .manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == os && p.architecture == arch)
            })
            .ok_or_else(|| {
                let available = index
                    .manifests
                    .iter()
                    .filter_map(|m| {
                        m.platform
                            .as_ref()
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                BoxforgeError::Image(format!(
                    "No image found for platform {}/{}. Available platforms: {}",
                    os, arch, available
                ))
            })?;

        let platform_reference = Reference::with_digest(
            reference.registry().to_string(),
            reference.repository().to_string(),
            entry.digest.clone(),
        );

        tracing::debug!(digest = %entry.digest, "Pulling platform manifest");
        let (platform_manifest, platform_digest) = self
            .client
            .pull_manifest(&platform_reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| BoxforgeError::Image(format!("Failed to pull platform manifest: {e}")))?;

        {
            let inner = self.inner.read().await;
            inner
                .storage
                .save_manifest(&platform_manifest, &platform_digest)?;
        }

        match platform_manifest {
            OciManifest::Image(ref img) => Ok(ResolvedManifest {
                manifest_digest: platform_digest,
                config_digest: img.config.digest.clone(),
                layers: Self::layers_from_image(img),
            }),
            OciManifest::ImageIndex(_) => Err(BoxforgeError::Image(
                "Platform manifest is not an image".into(),
            )),
        }
    }

    async fn download_layers(
        &self,
        reference: &Reference,
        layers: &[RemoteLayer],
    ) -> BoxforgeResult<()> {
        use futures::future::join_all;

        let mut to_download = Vec::new();
        {
            let inner = self.inner.read().await;
            for layer in layers {
                if !inner.storage.has_blob(&layer.digest) {
                    to_download.push(layer.clone());
                    continue;
                }
                match inner.storage.verify_blob(&layer.digest).await {
                    Ok(true) => tracing::debug!(digest = %layer.digest, "Layer cached and verified"),
                    _ => {
                        tracing::warn!(digest = %layer.digest, "Cached layer corrupted, will re-download");
                        if let Ok(path) = inner.storage.blob_path(&layer.digest) {
                            let _ = std::fs::remove_file(path);
                        }
                        to_download.push(layer.clone());
                    }
                }
            }
        }

        if to_download.is_empty() {
            return Ok(());
        }

        tracing::info!(count = to_download.len(), "Downloading layers in parallel");
        let results = join_all(
            to_download
                .iter()
                .map(|layer| self.download_blob(reference, &layer.digest, &layer.media_type)),
        )
        .await;

        results.into_iter().collect()
    }

    async fn download_blob(
        &self,
        reference: &Reference,
        digest: &str,
        media_type: &str,
    ) -> BoxforgeResult<()> {
        {
            let inner = self.inner.read().await;
            if inner.storage.has_blob(digest) {
                tracing::debug!(digest = %digest, "Blob already cached");
                return Ok(());
            }
        }

        let mut last_error = None;
        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            if attempt > 1 {
                tracing::info!(digest = %digest, attempt, "Retrying blob download");
            }

            let mut staged = {
                let inner = self.inner.read().await;
                inner.storage.stage_blob_download(digest).await?
            };

            let descriptor = OciDescriptor {
                digest: digest.to_string(),
                media_type: media_type.to_string(),
                size: 0,
                urls: None,
                annotations: None,
            };

            match self
                .client
                .pull_blob(reference, &descriptor, staged.file())
                .await
            {
                Ok(_) => match staged.commit().await {
                    Ok(true) => {
                        tracing::debug!(digest = %digest, "Downloaded and verified blob");
                        return Ok(());
                    }
                    Ok(false) => {
                        tracing::warn!(digest = %digest, attempt, "Blob hash mismatch");
                        last_error = Some(format!("integrity check failed for {}", digest));
                    }
                    Err(e) => {
                        tracing::warn!(digest = %digest, attempt, error = %e, "Blob commit failed");
                        last_error = Some(format!("commit failed for {}: {}", digest, e));
                    }
                },
                Err(e) => {
                    tracing::warn!(digest = %digest, attempt, error = %e, "Blob download failed");
                    last_error = Some(format!("failed to pull {}: {e}", digest));
                    staged.abort().await;
                }
            }
        }

        Err(BoxforgeError::Image(last_error.unwrap_or_else(|| {
            format!("download of {} failed after retries", digest)
        })))
    }
}
