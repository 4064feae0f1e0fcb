//! Dependency installation.
//!
//! The assembly only sees the `PackageInstaller` seam: given a dependency
//! manifest and a layer root, put the installed packages under the root.

mod pip;
mod target;

pub use pip::PipInstaller;
pub use target::InstallTarget;

use crate::build::normalize_image_path;
use async_trait::async_trait;
use boxforge_shared::constants::defaults;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One installation job.
#[derive(Clone, Debug)]
pub struct InstallRequest {
    /// Dependency manifest on the host (the copy that goes into the image)
    pub manifest: PathBuf,
    /// Directory standing for the image root; packages land below it
    pub root: PathBuf,
    /// In-image install prefix, e.g. `/usr/local`
    pub prefix: String,
    /// Interpreter and platform taken from the base image
    pub target: InstallTarget,
    /// Exported as SOURCE_DATE_EPOCH to the installer
    pub source_date_epoch: u64,
}

impl InstallRequest {
    /// Host directory standing for the image's site-packages.
    pub fn site_packages_dir(&self) -> PathBuf {
        let in_image = self.target.site_packages(&self.prefix);
        self.root.join(in_image.trim_start_matches('/'))
    }
}

/// Outcome of a successful installation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installer: String,
    pub attempts: u32,
    pub duration: Duration,
    /// Last lines of installer output, for logs
    pub output_tail: Vec<String>,
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Short name for logs and history, e.g. `pip`.
    fn name(&self) -> &str;

    /// Install everything `request.manifest` lists under `request.root`.
    ///
    /// Returns `BoxforgeError::Install` on any failure.
    async fn install(&self, request: &InstallRequest) -> BoxforgeResult<InstallReport>;
}

/// Installer settings from the build file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallOptions {
    /// Installer command prefix; `install ...` arguments are appended.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Target interpreter `major.minor`; read from the base image's
    /// `PYTHON_VERSION` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra attempts after a failure (0 = fail on first error)
    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

const MAX_RETRIES: u32 = 10;

fn default_command() -> Vec<String> {
    vec!["python3".into(), "-m".into(), "pip".into()]
}

fn default_prefix() -> String {
    defaults::INSTALL_PREFIX.to_string()
}

fn default_timeout_secs() -> u64 {
    900
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            command: default_command(),
            extra_args: Vec::new(),
            prefix: default_prefix(),
            python_version: None,
            timeout_secs: default_timeout_secs(),
            retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl InstallOptions {
    pub fn validate(&self) -> BoxforgeResult<()> {
        if self.command.first().is_none_or(|c| c.trim().is_empty()) {
            return Err(BoxforgeError::Config(
                "install.command must name a program".into(),
            ));
        }
        if normalize_image_path(&self.prefix)? == "/" {
            return Err(BoxforgeError::Config(
                "install.prefix must not be the image root".into(),
            ));
        }
        if let Some(version) = &self.python_version
            && target::python_minor(version).as_deref() != Some(version.trim())
        {
            return Err(BoxforgeError::Config(format!(
                "install.python_version '{}' must look like 3.12",
                version
            )));
        }
        if self.timeout_secs == 0 {
            return Err(BoxforgeError::Config(
                "install.timeout_secs must be positive".into(),
            ));
        }
        if self.retries > MAX_RETRIES {
            return Err(BoxforgeError::Config(format!(
                "install.retries must be at most {}",
                MAX_RETRIES
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry `attempt` (1-based): backoff doubles each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Run `installer`, retrying per `options`.
///
/// The layer root is emptied before each retry so a failed attempt leaves
/// nothing behind.
pub async fn install_with_retry(
    installer: &dyn PackageInstaller,
    request: &InstallRequest,
    options: &InstallOptions,
) -> BoxforgeResult<InstallReport> {
    let start = Instant::now();
    let attempts = options.retries + 1;

    let mut attempt = 1;
    loop {
        match installer.install(request).await {
            Ok(mut report) => {
                report.attempts = attempt;
                report.duration = start.elapsed();
                return Ok(report);
            }
            Err(e) if attempt < attempts => {
                let delay = options.backoff(attempt);
                tracing::warn!(
                    installer = installer.name(),
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Dependency installation failed, retrying"
                );
                reset_root(&request.root)?;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn reset_root(root: &Path) -> BoxforgeResult<()> {
    if root.exists() {
        std::fs::remove_dir_all(root).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to clear {}: {}", root.display(), e))
        })?;
    }
    std::fs::create_dir_all(root).map_err(|e| {
        BoxforgeError::Storage(format!("Failed to create {}: {}", root.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyInstaller {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PackageInstaller for FlakyInstaller {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn install(&self, request: &InstallRequest) -> BoxforgeResult<InstallReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::fs::write(request.root.join(format!("attempt-{}", call)), "").unwrap();
            if call <= self.failures {
                return Err(BoxforgeError::Install(format!("attempt {} failed", call)));
            }
            Ok(InstallReport {
                installer: "flaky".into(),
                ..Default::default()
            })
        }
    }

    fn request(dir: &Path) -> InstallRequest {
        let root = dir.join("root");
        std::fs::create_dir_all(&root).unwrap();
        InstallRequest {
            manifest: dir.join("requirements.txt"),
            root,
            prefix: "/usr/local".into(),
            target: InstallTarget {
                python_version: "3.12".into(),
                platform: "manylinux2014_x86_64".into(),
            },
            source_date_epoch: 0,
        }
    }

    fn fast(retries: u32) -> InstallOptions {
        InstallOptions {
            retries,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let o = InstallOptions::default();
        assert_eq!(o.command, vec!["python3", "-m", "pip"]);
        assert_eq!(o.prefix, "/usr/local");
        assert_eq!(o.timeout(), Duration::from_secs(900));
        assert_eq!(o.retries, 0);
        o.validate().unwrap();
    }

    #[test]
    fn backoff_doubles() {
        let o = InstallOptions::default();
        assert_eq!(o.backoff(1), Duration::from_millis(2000));
        assert_eq!(o.backoff(2), Duration::from_millis(4000));
        assert_eq!(o.backoff(3), Duration::from_millis(8000));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad = [
            InstallOptions { command: vec![], ..Default::default() },
            InstallOptions { prefix: "usr".into(), ..Default::default() },
            InstallOptions { prefix: "/".into(), ..Default::default() },
            InstallOptions { timeout_secs: 0, ..Default::default() },
            InstallOptions { retries: 11, ..Default::default() },
            InstallOptions { python_version: Some("3.12.4".into()), ..Default::default() },
            InstallOptions { python_version: Some("py3".into()), ..Default::default() },
        ];
        for o in bad {
            assert!(o.validate().unwrap_err().is_user_error(), "{o:?}");
        }
    }

    #[test]
    fn site_packages_dir_is_versioned() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        assert_eq!(
            req.site_packages_dir(),
            dir.path().join("root/usr/local/lib/python3.12/site-packages")
        );
    }

    #[tokio::test]
    async fn no_retry_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FlakyInstaller { failures: 1, calls: AtomicU32::new(0) };

        let err = install_with_retry(&installer, &request(dir.path()), &fast(0))
            .await
            .unwrap_err();

        assert!(matches!(err, BoxforgeError::Install(_)));
        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_and_clears_root() {
        let dir = tempfile::tempdir().unwrap();
        let installer = FlakyInstaller { failures: 2, calls: AtomicU32::new(0) };
        let req = request(dir.path());

        let report = install_with_retry(&installer, &req, &fast(2)).await.unwrap();

        assert_eq!(report.attempts, 3);
        assert!(!req.root.join("attempt-1").exists());
        assert!(!req.root.join("attempt-2").exists());
        assert!(req.root.join("attempt-3").exists());
    }
}
