pub mod archive;
mod base;
mod config;
mod index;
mod layout;
mod reference;
mod storage;
mod store;

pub use base::{BaseImage, BaseSource, LayerRef};
pub use config::{
    ConfigSummary, HistoryEntry, RuntimeSettings, apply_runtime_settings, config_summary, merge_env,
};
pub use layout::{LayoutWriter, OciImageLayout, canonical_json, descriptor};
pub use reference::{Pin, PinnedReference};
pub use store::ImageStore;

use oci_client::Reference;

/// `(os, architecture)` of the host in OCI platform terms.
pub(crate) fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        "arm" => "arm",
        other => other,
    };
    ("linux", arch)
}

// ============================================================================
// Registry Resolution (Reference Iterator)
// ============================================================================

/// Iterator that yields `Reference` candidates for an image.
///
/// For qualified images (e.g., `"ghcr.io/foo/bar:1.0"`), yields only the
/// original. For unqualified images (e.g., `"python:3.12"`), yields one
/// `Reference` per configured registry, keeping the tag or digest.
///
/// ```ignore
/// let registries = vec!["docker.io".into(), "quay.io".into()];
/// let iter = ReferenceIter::new("python:3.12", &registries)?;
/// // docker.io/library/python:3.12, quay.io/library/python:3.12
/// ```
pub(crate) struct ReferenceIter<'a> {
    /// The parsed base reference (before registry substitution).
    base_ref: Reference,
    /// Registries to try for unqualified images, in order.
    registries: &'a [String],
    index: usize,
    /// Whether the image ref names its registry; if so, registries are ignored.
    is_qualified: bool,
    yielded_original: bool,
}

impl<'a> ReferenceIter<'a> {
    pub fn new(image_ref: &str, registries: &'a [String]) -> Result<Self, oci_client::ParseError> {
        let base_ref: Reference = image_ref.parse()?;
        let is_qualified = is_fully_qualified(image_ref);

        tracing::debug!(
            image_ref = %image_ref,
            is_qualified = %is_qualified,
            registry_count = registries.len(),
            "Created reference iterator for image resolution"
        );

        Ok(Self {
            base_ref,
            registries,
            index: 0,
            is_qualified,
            yielded_original: false,
        })
    }
}

impl Iterator for ReferenceIter<'_> {
    type Item = Reference;

    fn next(&mut self) -> Option<Self::Item> {
        // Qualified, or nowhere else to look: the original once (docker.io default)
        if self.is_qualified || self.registries.is_empty() {
            if self.yielded_original {
                return None;
            }
            self.yielded_original = true;
            return Some(self.base_ref.clone());
        }

        let registry = self.registries.get(self.index)?.clone();
        self.index += 1;

        let repository = self.base_ref.repository().to_string();
        Some(match self.base_ref.digest() {
            Some(digest) => Reference::with_digest(registry, repository, digest.to_string()),
            None => {
                let tag = self.base_ref.tag().unwrap_or("latest").to_string();
                Reference::with_tag(registry, repository, tag)
            }
        })
    }
}

/// Check if an image reference is fully qualified (contains a registry).
///
/// The part before the first `/` is a registry when it contains a `.` or a
/// `:`, or is exactly `localhost`.
fn is_fully_qualified(image_ref: &str) -> bool {
    if let Some(slash_pos) = image_ref.find('/') {
        let first_part = &image_ref[..slash_pos];
        first_part.contains('.') || first_part.contains(':') || first_part == "localhost"
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_refs(iter: ReferenceIter) -> Vec<(String, String, Option<String>)> {
        iter.map(|r| {
            (
                r.registry().to_string(),
                r.repository().to_string(),
                r.tag().map(|t| t.to_string()),
            )
        })
        .collect()
    }

    #[test]
    fn empty_registries_yield_original() {
        let registries: Vec<String> = vec![];
        let refs = collect_refs(ReferenceIter::new("python:3.12.4-slim", &registries).unwrap());

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "docker.io");
        assert_eq!(refs[0].1, "library/python");
    }

    #[test]
    fn one_candidate_per_registry() {
        let registries = vec!["ghcr.io".to_string(), "quay.io".to_string()];
        let refs = collect_refs(ReferenceIter::new("python:3.12", &registries).unwrap());

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, "ghcr.io");
        assert_eq!(refs[1].0, "quay.io");
        for r in &refs {
            assert_eq!(r.2.as_deref(), Some("3.12"));
        }
    }

    #[test]
    fn digest_survives_registry_substitution() {
        let digest = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
        let registries = vec!["mirror.example.com".to_string()];
        let refs: Vec<Reference> = ReferenceIter::new(&format!("python@{}", digest), &registries)
            .unwrap()
            .collect();

        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].registry(), "mirror.example.com");
        assert_eq!(refs[0].digest(), Some(digest));
    }

    #[test]
    fn qualified_bypasses_registries() {
        let registries = vec!["ghcr.io".to_string()];

        let refs = collect_refs(ReferenceIter::new("quay.io/team/python:3.11", &registries).unwrap());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "quay.io");

        let refs = collect_refs(ReferenceIter::new("localhost:5000/python:3.11", &registries).unwrap());
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "localhost:5000");
    }

    #[test]
    fn qualification_rules() {
        assert!(is_fully_qualified("docker.io/library/python"));
        assert!(is_fully_qualified("localhost/python"));
        assert!(is_fully_qualified("registry.local:5000/python"));

        assert!(!is_fully_qualified("python"));
        assert!(!is_fully_qualified("python:3.12"));
        assert!(!is_fully_qualified("library/python"));
    }

    #[test]
    fn host_platform_is_linux() {
        let (os, arch) = host_platform();
        assert_eq!(os, "linux");
        assert!(!arch.is_empty());
    }
}
