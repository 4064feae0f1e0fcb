//! Shared fixtures for BoxForge tests.
//!
//! - [`write_base_layout`]: a small base image as an on-disk OCI layout,
//!   built without going through BoxForge's own packer
//! - [`FakeInstaller`]: a deterministic stand-in for pip
//! - [`ContextFixture`]: build contexts for the two reference applications
//! - [`TestForge`]: a `Forge` on a throwaway home directory

use async_trait::async_trait;
use boxforge::install::{InstallReport, InstallRequest, PackageInstaller};
use boxforge::{AssemblyRequest, BoxforgeError, BoxforgeResult, BuildContext, BuildSpec, Forge, ForgeOptions};
use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Requirement name that makes [`FakeInstaller`] fail.
pub const MISSING_PACKAGE: &str = "this-package-does-not-exist";

/// Content of `/src/stale.txt` in the fixture base image.
pub const BASE_STALE_FILE: &str = "from the base image\n";

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

// ============================================================================
// BASE IMAGE
// ============================================================================

/// A base image written by [`write_base_layout`].
#[derive(Clone, Debug)]
pub struct BaseLayout {
    pub root: PathBuf,
    pub manifest_digest: String,
    pub layer_digest: String,
    pub diff_id: String,
}

enum Entry<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8], u32),
}

/// Write a one-layer base image at `root`.
///
/// The layer holds a fake interpreter at `/usr/local/bin/python`,
/// `/etc/os-release`, and `/src/stale.txt` so tests can check that the
/// source tree hides base content. Its config sets `Entrypoint` and `Cmd`.
pub fn write_base_layout(root: &Path) -> BaseLayout {
    let entries = [
        Entry::Dir("etc"),
        Entry::File("etc/os-release", b"ID=fixture\n", 0o644),
        Entry::Dir("src"),
        Entry::File("src/stale.txt", BASE_STALE_FILE.as_bytes(), 0o644),
        Entry::Dir("usr"),
        Entry::Dir("usr/local"),
        Entry::Dir("usr/local/bin"),
        Entry::File("usr/local/bin/python", b"#!/bin/sh\nexit 0\n", 0o755),
    ];

    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        for entry in &entries {
            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            match entry {
                Entry::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, format!("{}/", path), std::io::empty())
                        .unwrap();
                }
                Entry::File(path, data, mode) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, path, *data).unwrap();
                }
            }
        }
        builder.finish().unwrap();
    }

    let mut encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    let gz_bytes = encoder.finish().unwrap();

    let diff_id = sha256_digest(&tar_bytes);
    let blobs = root.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs).unwrap();

    let write_blob = |bytes: &[u8]| -> (String, usize) {
        let digest = sha256_digest(bytes);
        std::fs::write(blobs.join(digest.trim_start_matches("sha256:")), bytes).unwrap();
        (digest, bytes.len())
    };

    let (layer_digest, layer_size) = write_blob(&gz_bytes);

    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Env": ["PATH=/usr/local/bin:/usr/bin:/bin", "LANG=C.UTF-8", "PYTHON_VERSION=3.12.4"],
            "Entrypoint": ["docker-entrypoint.sh"],
            "Cmd": ["python3"],
            "WorkingDir": "/"
        },
        "rootfs": {"type": "layers", "diff_ids": [diff_id]},
        "history": [{"created": "1970-01-01T00:00:00Z", "created_by": "fixture base"}]
    });
    let (config_digest, config_size) = write_blob(&serde_json::to_vec(&config).unwrap());

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_size
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": layer_digest,
            "size": layer_size
        }]
    });
    let (manifest_digest, manifest_size) = write_blob(&serde_json::to_vec(&manifest).unwrap());

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_size
        }]
    });
    std::fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    std::fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    BaseLayout {
        root: root.to_path_buf(),
        manifest_digest,
        layer_digest,
        diff_id,
    }
}

// ============================================================================
// INSTALLER
// ============================================================================

/// Installs each requirement as a stub package into the request's
/// versioned site-packages, e.g. `<root>/usr/local/lib/python3.12/site-packages/`.
///
/// Fails like pip would when the manifest names [`MISSING_PACKAGE`].
#[derive(Debug, Default)]
pub struct FakeInstaller {
    calls: AtomicU32,
}

impl FakeInstaller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for FakeInstaller {
    fn name(&self) -> &str {
        "fake-pip"
    }

    async fn install(&self, request: &InstallRequest) -> BoxforgeResult<InstallReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let manifest = std::fs::read_to_string(&request.manifest)
            .map_err(|e| BoxforgeError::Install(format!("cannot read manifest: {}", e)))?;

        let site_packages = request.site_packages_dir();

        for line in manifest.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#')) {
            let (name, version) = line.split_once("==").unwrap_or((line, "0"));
            if name == MISSING_PACKAGE {
                return Err(BoxforgeError::Install(format!(
                    "ERROR: No matching distribution found for {}",
                    line
                )));
            }

            let package = site_packages.join(name.replace('-', "_"));
            std::fs::create_dir_all(&package)
                .map_err(|e| BoxforgeError::Install(e.to_string()))?;
            std::fs::write(
                package.join("__init__.py"),
                format!("__version__ = \"{}\"\n", version),
            )
            .map_err(|e| BoxforgeError::Install(e.to_string()))?;
        }

        Ok(InstallReport {
            installer: self.name().to_string(),
            attempts: 1,
            ..Default::default()
        })
    }
}

// ============================================================================
// BUILD CONTEXTS
// ============================================================================

/// Build context in a temp directory.
pub struct ContextFixture {
    dir: TempDir,
}

impl Default for ContextFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextFixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Script application: `src/main.py`, a config tree, no env files and
    /// `requests==2.31.0`, on the fixture base.
    pub fn script_app() -> Self {
        let ctx = Self::new();
        ctx.write("src/main.py", "print('hello from boxforge')\n");
        ctx.write("src/lib/helpers.py", "def greet():\n    return 'hi'\n");
        ctx.write("conf/settings.toml", "[server]\nport = 8080\n");
        ctx.write("requirements.txt", "requests==2.31.0\n");
        ctx.with_base_layout();
        ctx.write(
            "boxforge.yaml",
            "base:\n  layout: base-oci\n\
             source:\n  path: src\n\
             entry:\n  script: /src/main.py\n",
        );
        ctx
    }

    /// Module application under `app/`, whose manifest names a package that
    /// does not exist.
    pub fn module_app() -> Self {
        let ctx = Self::new();
        ctx.write("app/__init__.py", "");
        ctx.write("app/app.py", "print('module app')\n");
        ctx.write("conf/app.ini", "[app]\ndebug = false\n");
        ctx.write(".env", "APP_ENV=production\n");
        ctx.write("requirements.txt", &format!("{}==0.0.0\n", MISSING_PACKAGE));
        ctx.with_base_layout();
        ctx.write(
            "boxforge.yaml",
            "base:\n  layout: base-oci\n\
             source:\n  path: app\n  dest: /app\n\
             entry:\n  module: app.app\n\
             workdir: /\n",
        );
        ctx
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `content` at the context-relative `path`, creating parents.
    pub fn write(&self, path: &str, content: &str) -> &Self {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
        self
    }

    pub fn remove(&self, path: &str) -> &Self {
        let path = self.dir.path().join(path);
        if path.is_dir() {
            std::fs::remove_dir_all(path).unwrap();
        } else {
            std::fs::remove_file(path).unwrap();
        }
        self
    }

    /// Write the fixture base image at `base-oci/`.
    pub fn with_base_layout(&self) -> BaseLayout {
        write_base_layout(&self.dir.path().join("base-oci"))
    }

    pub fn build_file(&self) -> PathBuf {
        self.dir.path().join("boxforge.yaml")
    }

    pub fn context(&self) -> BuildContext {
        BuildContext::new(self.dir.path()).unwrap()
    }

    pub fn spec(&self) -> BuildSpec {
        BuildSpec::load(&self.build_file()).unwrap()
    }
}

// ============================================================================
// FORGE
// ============================================================================

/// A `Forge` on a throwaway home directory, plus a scratch area for outputs.
pub struct TestForge {
    pub forge: Forge,
    home: TempDir,
    out: TempDir,
}

impl Default for TestForge {
    fn default() -> Self {
        Self::new()
    }
}

impl TestForge {
    pub fn new() -> Self {
        let home = tempfile::tempdir().unwrap();
        let forge = Forge::new(ForgeOptions::with_home(home.path())).unwrap();
        Self {
            forge,
            home,
            out: tempfile::tempdir().unwrap(),
        }
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    /// Output path `name` in the scratch area (not created).
    pub fn output(&self, name: &str) -> PathBuf {
        self.out.path().join(name)
    }

    /// Request for `ctx`'s own build file.
    pub fn request(&self, ctx: &ContextFixture, output: &Path) -> AssemblyRequest {
        AssemblyRequest {
            spec: ctx.spec(),
            context: ctx.context(),
            output: output.to_path_buf(),
            tag: None,
        }
    }

    /// Build workspaces currently under the home directory.
    pub fn workspaces(&self) -> usize {
        std::fs::read_dir(self.forge.layout().builds_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
