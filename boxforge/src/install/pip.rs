//! pip-driven installer.

use super::{InstallOptions, InstallReport, InstallRequest, PackageInstaller};
use async_trait::async_trait;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Lines of installer output kept for error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// Runs `<command> install ... -r <manifest>` on the host.
///
/// Wheels are resolved for the base image's interpreter and platform and
/// unpacked with `--target` straight into the layer's site-packages.
#[derive(Clone, Debug)]
pub struct PipInstaller {
    command: Vec<String>,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl PipInstaller {
    pub fn new(options: &InstallOptions) -> Self {
        Self {
            command: options.command.clone(),
            extra_args: options.extra_args.clone(),
            timeout: options.timeout(),
        }
    }

    /// Full argv for `request`.
    pub fn argv(&self, request: &InstallRequest) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.extend(
            [
                "install",
                "--no-cache-dir",
                "--disable-pip-version-check",
                "--no-compile",
                "--python-version",
                request.target.python_version.as_str(),
                "--implementation",
                "cp",
                "--platform",
                request.target.platform.as_str(),
                "--only-binary=:all:",
                "--target",
            ]
            .map(String::from),
        );
        argv.push(request.site_packages_dir().display().to_string());
        argv.extend(self.extra_args.iter().cloned());
        argv.push("-r".into());
        argv.push(request.manifest.display().to_string());
        argv
    }
}

#[async_trait]
impl PackageInstaller for PipInstaller {
    fn name(&self) -> &str {
        "pip"
    }

    async fn install(&self, request: &InstallRequest) -> BoxforgeResult<InstallReport> {
        let argv = self.argv(request);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BoxforgeError::Config("install.command is empty".into()))?;

        tracing::info!(
            command = %argv.join(" "),
            timeout_secs = self.timeout.as_secs(),
            "Running dependency installer"
        );

        let start = Instant::now();
        let child = Command::new(program)
            .args(args)
            .env("PIP_NO_INPUT", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("SOURCE_DATE_EPOCH", request.source_date_epoch.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BoxforgeError::Install(format!("Failed to start installer '{}': {}", program, e))
            })?;

        // On timeout the future (and the child with it) is dropped, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                BoxforgeError::Install(format!("Failed to wait for installer: {}", e))
            })?,
            Err(_) => {
                return Err(BoxforgeError::Install(format!(
                    "Installer timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            tracing::debug!(target: "boxforge::install::output", "{}", line);
        }

        if !output.status.success() {
            let source = if stderr.trim().is_empty() { &stdout } else { &stderr };
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(BoxforgeError::Install(format!(
                "Installer exited with {}:\n{}",
                code,
                tail(source, OUTPUT_TAIL_LINES).join("\n")
            )));
        }

        let elapsed = start.elapsed();
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "Dependencies installed");

        Ok(InstallReport {
            installer: self.name().to_string(),
            attempts: 1,
            duration: elapsed,
            output_tail: tail(&stdout, OUTPUT_TAIL_LINES),
        })
    }
}

fn tail(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}
