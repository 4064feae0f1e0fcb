//! Interpreter and platform that dependencies are installed for.
//!
//! The installer runs on the host, so the wheels it picks and the
//! site-packages directory it fills must come from the base image rather
//! than from whatever Python the host has.

use super::InstallOptions;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_spec::image::ImageConfiguration;

/// Env var official python images set to the full interpreter version.
const PYTHON_VERSION_ENV: &str = "PYTHON_VERSION";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallTarget {
    /// `major.minor`, e.g. `3.12`
    pub python_version: String,
    /// Wheel platform tag, e.g. `manylinux2014_x86_64`
    pub platform: String,
}

impl InstallTarget {
    /// Work out the target from the base image config.
    ///
    /// `install.python_version` wins over the image's `PYTHON_VERSION`.
    pub fn resolve(options: &InstallOptions, base: &ImageConfiguration) -> BoxforgeResult<Self> {
        let os = base.os().to_string();
        if os != "linux" {
            return Err(BoxforgeError::Config(format!(
                "Cannot install dependencies for a '{}' base image",
                os
            )));
        }

        let python_version = match &options.python_version {
            Some(version) => python_minor(version).ok_or_else(|| {
                BoxforgeError::Config(format!(
                    "install.python_version '{}' is not a major.minor version",
                    version
                ))
            })?,
            None => image_python_version(base).ok_or_else(|| {
                BoxforgeError::Config(format!(
                    "The base image does not set {}; set install.python_version",
                    PYTHON_VERSION_ENV
                ))
            })?,
        };

        let architecture = base.architecture().to_string();
        let variant = base.variant().as_deref().unwrap_or_default();
        let machine = wheel_machine(&architecture, variant).ok_or_else(|| {
            BoxforgeError::Config(format!(
                "No wheel platform for base architecture '{}'",
                architecture
            ))
        })?;

        Ok(Self {
            python_version,
            platform: format!("manylinux2014_{}", machine),
        })
    }

    /// In-image site-packages directory below `prefix`.
    pub fn site_packages(&self, prefix: &str) -> String {
        format!(
            "{}/lib/python{}/site-packages",
            prefix.trim_end_matches('/'),
            self.python_version
        )
    }
}

fn image_python_version(base: &ImageConfiguration) -> Option<String> {
    let env = base.config().as_ref()?.env().as_ref()?;
    env.iter()
        .filter_map(|entry| entry.split_once('='))
        .find(|(key, _)| *key == PYTHON_VERSION_ENV)
        .and_then(|(_, value)| python_minor(value))
}

/// `3.12.4` -> `3.12`, `3.13.0rc1` -> `3.13`, `3.12` -> `3.12`.
pub(crate) fn python_minor(version: &str) -> Option<String> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !numeric(major) || !numeric(&minor) {
        return None;
    }
    Some(format!("{}.{}", major, minor))
}

fn wheel_machine(architecture: &str, variant: &str) -> Option<&'static str> {
    match (architecture, variant) {
        ("amd64", _) => Some("x86_64"),
        ("arm64", _) => Some("aarch64"),
        ("386", _) => Some("i686"),
        ("arm", "v7") => Some("armv7l"),
        ("ppc64le", _) => Some("ppc64le"),
        ("s390x", _) => Some("s390x"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(architecture: &str, env: &[&str]) -> ImageConfiguration {
        serde_json::from_value(serde_json::json!({
            "architecture": architecture,
            "os": "linux",
            "config": { "Env": env },
            "rootfs": {"type": "layers", "diff_ids": []}
        }))
        .unwrap()
    }

    #[test]
    fn reads_python_version_from_image_env() {
        let base = image("amd64", &["PATH=/usr/local/bin", "PYTHON_VERSION=3.12.4"]);
        let target = InstallTarget::resolve(&InstallOptions::default(), &base).unwrap();
        assert_eq!(target.python_version, "3.12");
        assert_eq!(target.platform, "manylinux2014_x86_64");
        assert_eq!(
            target.site_packages("/usr/local"),
            "/usr/local/lib/python3.12/site-packages"
        );
    }

    #[test]
    fn explicit_version_wins() {
        let base = image("arm64", &["PYTHON_VERSION=3.12.4"]);
        let options = InstallOptions {
            python_version: Some("3.11".into()),
            ..Default::default()
        };
        let target = InstallTarget::resolve(&options, &base).unwrap();
        assert_eq!(target.python_version, "3.11");
        assert_eq!(target.platform, "manylinux2014_aarch64");
    }

    #[test]
    fn missing_version_is_config_error() {
        let base = image("amd64", &["LANG=C.UTF-8"]);
        let err = InstallTarget::resolve(&InstallOptions::default(), &base).unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("install.python_version"));
    }

    #[test]
    fn unknown_architecture_is_config_error() {
        let base = image("riscv64", &["PYTHON_VERSION=3.12.4"]);
        assert!(InstallTarget::resolve(&InstallOptions::default(), &base).is_err());
    }

    #[test]
    fn minor_versions() {
        assert_eq!(python_minor("3.12.4").as_deref(), Some("3.12"));
        assert_eq!(python_minor("3.13.0rc1").as_deref(), Some("3.13"));
        assert_eq!(python_minor("3.9").as_deref(), Some("3.9"));
        assert_eq!(python_minor("3"), None);
        assert_eq!(python_minor("three.12"), None);
    }
}
