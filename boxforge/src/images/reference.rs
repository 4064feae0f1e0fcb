//! Pinned base image references.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_client::Reference;
use std::fmt;

/// What fixes a reference to one image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pin {
    /// `sha256:<hex>` manifest digest
    Digest(String),
    /// Explicit version tag, e.g. `3.12.4-slim`
    Tag(String),
}

/// A registry reference that resolves to a fixed image.
///
/// Accepted: any reference with a `@sha256:` digest, or an explicit tag that
/// is not `latest` and contains a version number. Bare names default to
/// `latest` upstream, so they are refused here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinnedReference {
    original: String,
    reference: Reference,
    pin: Pin,
}

impl PinnedReference {
    pub fn parse(raw: &str) -> BoxforgeResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BoxforgeError::Config("Base image reference is empty".into()));
        }

        let reference: Reference = raw.parse().map_err(|e| {
            BoxforgeError::Config(format!("Invalid base image reference '{}': {}", raw, e))
        })?;

        let pin = if let Some(digest) = reference.digest() {
            if !is_sha256_digest(digest) {
                return Err(BoxforgeError::Config(format!(
                    "Base image '{}' has unsupported digest '{}', expected sha256:<64 hex>",
                    raw, digest
                )));
            }
            Pin::Digest(digest.to_string())
        } else {
            // oci_client fills in `latest` for a missing tag, so look at what
            // was actually written.
            let tag = explicit_tag(raw).ok_or_else(|| {
                BoxforgeError::Config(format!(
                    "Base image '{}' is not pinned: add a version tag or @sha256 digest",
                    raw
                ))
            })?;

            if tag == "latest" {
                return Err(BoxforgeError::Config(format!(
                    "Base image '{}' is not pinned: 'latest' moves over time",
                    raw
                )));
            }
            if !tag.chars().any(|c| c.is_ascii_digit()) {
                return Err(BoxforgeError::Config(format!(
                    "Base image '{}' is not pinned: tag '{}' carries no version number",
                    raw, tag
                )));
            }
            Pin::Tag(tag.to_string())
        };

        Ok(Self {
            original: raw.to_string(),
            reference,
            pin,
        })
    }

    /// The reference as written in the build file.
    pub fn as_str(&self) -> &str {
        &self.original
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn pin(&self) -> &Pin {
        &self.pin
    }

    pub fn is_digest(&self) -> bool {
        matches!(self.pin, Pin::Digest(_))
    }

    /// Fully expanded form, e.g. `docker.io/library/python:3.12.4-slim`.
    pub fn whole(&self) -> String {
        self.reference.whole()
    }
}

impl fmt::Display for PinnedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

fn explicit_tag(raw: &str) -> Option<&str> {
    let name = raw.split('@').next().unwrap_or(raw);
    // A ':' before the last '/' belongs to a registry port.
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    last_segment
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|t| !t.is_empty())
}

pub(crate) fn is_sha256_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn accepts_versioned_tags() {
        let r = PinnedReference::parse("python:3.12.4-slim").unwrap();
        assert_eq!(r.pin(), &Pin::Tag("3.12.4-slim".into()));
        assert_eq!(r.whole(), "docker.io/library/python:3.12.4-slim");

        let r = PinnedReference::parse("localhost:5000/team/python:3.11").unwrap();
        assert_eq!(r.pin(), &Pin::Tag("3.11".into()));
    }

    #[test]
    fn accepts_digests() {
        let r = PinnedReference::parse(&format!("python@{}", DIGEST)).unwrap();
        assert!(r.is_digest());

        // Digest wins over a tag that would not pass on its own.
        let r = PinnedReference::parse(&format!("python:slim@{}", DIGEST)).unwrap();
        assert!(r.is_digest());
    }

    #[test]
    fn rejects_unpinned() {
        for raw in ["python", "python:latest", "python:slim", "localhost:5000/python", ""] {
            let err = PinnedReference::parse(raw).unwrap_err();
            assert!(err.is_user_error(), "{raw} should be a config error");
        }
    }

    #[test]
    fn rejects_short_digest() {
        assert!(PinnedReference::parse("python@sha256:abc").is_err());
    }

    proptest! {
        #[test]
        fn any_sha256_digest_is_pinned(hex in "[0-9a-f]{64}") {
            let raw = format!("python@sha256:{}", hex);
            prop_assert!(PinnedReference::parse(&raw).unwrap().is_digest());
        }

        #[test]
        fn tags_without_digits_are_refused(tag in "[a-z][a-z_-]{0,15}") {
            let raw = format!("python:{}", tag);
            prop_assert!(PinnedReference::parse(&raw).is_err());
        }

        #[test]
        fn tags_with_version_are_accepted(major in 2u8..4, minor in 0u8..20, suffix in "(-slim|-alpine|)") {
            let raw = format!("python:{}.{}{}", major, minor, suffix);
            prop_assert!(PinnedReference::parse(&raw).is_ok());
        }
    }
}
