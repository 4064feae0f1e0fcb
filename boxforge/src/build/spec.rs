//! Build file model.
//!
//! A build file describes one image: the pinned base, the four input sets and
//! the entry command. YAML and JSON are both accepted.

use crate::build::entry::EntryCommand;
use crate::build::paths::normalize_image_path;
use crate::images::PinnedReference;
use crate::install::InstallOptions;
use boxforge_shared::constants::defaults;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Where the base runtime comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseSpec {
    /// Registry reference, e.g. `python:3.12.4-slim` or `python@sha256:...`
    Image(String),
    /// Local OCI image layout directory (relative to the build context)
    Layout(PathBuf),
}

/// A directory copied verbatim into the image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeSpec {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
}

/// Environment files selected by name pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvFilesSpec {
    #[serde(default = "default_env_pattern")]
    pub pattern: String,
    #[serde(default = "default_env_dest")]
    pub dest: String,
}

impl Default for EnvFilesSpec {
    fn default() -> Self {
        Self {
            pattern: default_env_pattern(),
            dest: default_env_dest(),
        }
    }
}

/// The dependency manifest file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestSpec {
    #[serde(default = "default_manifest_path")]
    pub path: PathBuf,
    #[serde(default = "default_manifest_dest")]
    pub dest: String,
}

impl Default for ManifestSpec {
    fn default() -> Self {
        Self {
            path: default_manifest_path(),
            dest: default_manifest_dest(),
        }
    }
}

/// Complete description of one image build.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub base: BaseSpec,

    pub source: TreeSpec,

    /// `null` disables the configuration step.
    #[serde(default = "default_config")]
    pub config: Option<TreeSpec>,

    #[serde(default)]
    pub env_files: EnvFilesSpec,

    #[serde(default)]
    pub dependencies: ManifestSpec,

    #[serde(with = "serde_yaml::with::singleton_map")]
    pub entry: EntryCommand,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,

    /// Extra environment, merged over the base image's env.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub install: InstallOptions,

    /// Timestamp (seconds since epoch) stamped on every new layer entry and
    /// on the image config.
    #[serde(default)]
    pub source_date_epoch: u64,
}

fn default_env_pattern() -> String {
    defaults::ENV_FILE_PATTERN.to_string()
}

fn default_env_dest() -> String {
    defaults::ENV_FILE_DEST.to_string()
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(defaults::MANIFEST_PATH)
}

fn default_manifest_dest() -> String {
    defaults::MANIFEST_DEST.to_string()
}

fn default_config() -> Option<TreeSpec> {
    Some(TreeSpec {
        path: PathBuf::from(defaults::CONFIG_PATH),
        dest: None,
    })
}

fn default_interpreter() -> String {
    defaults::INTERPRETER.to_string()
}

impl BuildSpec {
    /// Load a build file. `.json` files are parsed as JSON, anything else
    /// as YAML.
    pub fn load(path: &Path) -> BoxforgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxforgeError::Config(format!(
                "Failed to read build file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let spec = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
        .map_err(|e| match e {
            BoxforgeError::Config(msg) => {
                BoxforgeError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        tracing::debug!(path = %path.display(), "Loaded build file");
        Ok(spec)
    }

    pub fn from_yaml_str(content: &str) -> BoxforgeResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| BoxforgeError::Config(format!("invalid build file: {}", e)))
    }

    pub fn from_json_str(content: &str) -> BoxforgeResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| BoxforgeError::Config(format!("invalid build file: {}", e)))
    }

    /// Normalised source destination (default `/src`).
    pub fn source_dest(&self) -> BoxforgeResult<String> {
        tree_dest(&self.source, defaults::SOURCE_DEST, "source")
    }

    /// Normalised config destination (default `/conf`), `None` when the
    /// config step is disabled.
    pub fn config_dest(&self) -> BoxforgeResult<Option<String>> {
        self.config
            .as_ref()
            .map(|c| tree_dest(c, defaults::CONFIG_DEST, "config"))
            .transpose()
    }

    pub fn env_files_dest(&self) -> BoxforgeResult<String> {
        normalize_image_path(&self.env_files.dest)
    }

    pub fn manifest_dest(&self) -> BoxforgeResult<String> {
        let dest = normalize_image_path(&self.dependencies.dest)?;
        if dest == "/" {
            return Err(BoxforgeError::Config(
                "Dependency manifest destination must name a file".into(),
            ));
        }
        Ok(dest)
    }

    /// Normalised working directory, `None` keeps the base image's.
    pub fn workdir(&self) -> BoxforgeResult<Option<String>> {
        self.workdir.as_deref().map(normalize_image_path).transpose()
    }

    /// Parsed and pin-checked base reference (registry bases only).
    pub fn base_reference(&self) -> BoxforgeResult<Option<PinnedReference>> {
        match &self.base {
            BaseSpec::Image(reference) => PinnedReference::parse(reference).map(Some),
            BaseSpec::Layout(_) => Ok(None),
        }
    }

    /// Rendered entry argv.
    pub fn entry_argv(&self) -> Vec<String> {
        self.entry.argv(&self.interpreter)
    }

    /// Check everything that can be checked without touching the build
    /// context, the network or the installer.
    pub fn validate(&self) -> BoxforgeResult<()> {
        self.base_reference()?;
        let source_dest = self.source_dest()?;
        if let Some(config_dest) = self.config_dest()?
            && trees_overlap(&source_dest, &config_dest)
        {
            return Err(BoxforgeError::Config(format!(
                "config.dest '{}' overlaps source.dest '{}'; the config tree would replace source files",
                config_dest, source_dest
            )));
        }
        self.env_files_dest()?;
        self.manifest_dest()?;
        self.workdir()?;
        self.entry.validate()?;

        if self.interpreter.trim().is_empty() {
            return Err(BoxforgeError::Config("interpreter must not be empty".into()));
        }

        glob::Pattern::new(&self.env_files.pattern).map_err(|e| {
            BoxforgeError::Config(format!(
                "Invalid env file pattern '{}': {}",
                self.env_files.pattern, e
            ))
        })?;
        if self.env_files.pattern.contains('/') {
            return Err(BoxforgeError::Config(format!(
                "Env file pattern '{}' must match file names, not paths",
                self.env_files.pattern
            )));
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(BoxforgeError::Config(format!(
                    "Invalid environment variable name '{}'",
                    key
                )));
            }
        }

        self.install.validate()?;
        Ok(())
    }
}

fn tree_dest(tree: &TreeSpec, default: &str, what: &str) -> BoxforgeResult<String> {
    let dest = normalize_image_path(tree.dest.as_deref().unwrap_or(default))?;
    // A tree destination replaces everything below it; "/" would wipe the base.
    if dest == "/" {
        return Err(BoxforgeError::Config(format!(
            "The {} tree cannot be copied to the image root",
            what
        )));
    }
    Ok(dest)
}

/// True when one normalised image path equals or contains the other.
fn trees_overlap(a: &str, b: &str) -> bool {
    let within = |outer: &str, inner: &str| {
        inner == outer || inner.strip_prefix(outer).is_some_and(|rest| rest.starts_with('/'))
    };
    within(a, b) || within(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT_BUILD: &str = r#"
base:
  image: python:3.12.4-slim
source:
  path: src
entry:
  script: /src/main.py
"#;

    #[test]
    fn applies_defaults() {
        let spec = BuildSpec::from_yaml_str(SCRIPT_BUILD).unwrap();
        spec.validate().unwrap();

        assert_eq!(spec.source_dest().unwrap(), "/src");
        assert_eq!(spec.config_dest().unwrap().as_deref(), Some("/conf"));
        assert_eq!(spec.env_files.pattern, ".env*");
        assert_eq!(spec.env_files_dest().unwrap(), "/");
        assert_eq!(spec.dependencies.path, PathBuf::from("requirements.txt"));
        assert_eq!(spec.manifest_dest().unwrap(), "/requirements.txt");
        assert_eq!(spec.entry_argv(), vec!["python", "/src/main.py"]);
        assert_eq!(spec.install.retries, 0);
        assert_eq!(spec.source_date_epoch, 0);
    }

    #[test]
    fn null_config_disables_step() {
        let yaml = format!("{}config: null\n", SCRIPT_BUILD);
        let spec = BuildSpec::from_yaml_str(&yaml).unwrap();
        assert_eq!(spec.config_dest().unwrap(), None);
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = format!("{}volumes: [/data]\n", SCRIPT_BUILD);
        let err = BuildSpec::from_yaml_str(&yaml).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn rejects_unpinned_base() {
        let yaml = SCRIPT_BUILD.replace("python:3.12.4-slim", "python:latest");
        let spec = BuildSpec::from_yaml_str(&yaml).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_root_tree_destination() {
        let yaml = SCRIPT_BUILD.replace("path: src", "path: src\n  dest: /");
        let spec = BuildSpec::from_yaml_str(&yaml).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_path_like_env_pattern() {
        let yaml = format!("{}env_files:\n  pattern: conf/.env*\n", SCRIPT_BUILD);
        let spec = BuildSpec::from_yaml_str(&yaml).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_config_tree_over_source_tree() {
        for (source, config) in [("/app/src", "/app"), ("/app", "/app"), ("/app", "/app/conf")] {
            let yaml = SCRIPT_BUILD
                .replace("path: src", &format!("path: src\n  dest: {source}"))
                + &format!("config:\n  path: conf\n  dest: {config}\n");
            let spec = BuildSpec::from_yaml_str(&yaml).unwrap();
            let err = spec.validate().unwrap_err();
            assert!(err.is_user_error(), "{source} / {config}: {err}");
            assert!(err.to_string().contains("overlaps"));
        }
    }

    #[test]
    fn sibling_tree_destinations_are_fine() {
        assert!(!trees_overlap("/app", "/application"));
        assert!(!trees_overlap("/src", "/conf"));
        assert!(trees_overlap("/srv/app", "/srv/app/conf"));

        let yaml = SCRIPT_BUILD.replace("path: src", "path: src\n  dest: /app")
            + "config:\n  path: conf\n  dest: /application\n";
        BuildSpec::from_yaml_str(&yaml).unwrap().validate().unwrap();
    }

    #[test]
    fn demo_build_files_parse() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos");

        let script = BuildSpec::load(&demos.join("script-app/boxforge.yaml")).unwrap();
        script.validate().unwrap();
        assert_eq!(script.base, BaseSpec::Image("python:3.12.4-slim".into()));
        assert_eq!(script.entry_argv(), vec!["python", "/src/main.py"]);
        assert_eq!(script.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));

        let module = BuildSpec::load(&demos.join("module-app/boxforge.yaml")).unwrap();
        module.validate().unwrap();
        assert_eq!(module.entry, EntryCommand::Module("app.server".into()));
        assert_eq!(module.config_dest().unwrap().as_deref(), Some("/etc/module-app"));
        assert_eq!(module.install.retries, 2);
        assert_eq!(module.source_date_epoch, 1_700_000_000);
    }

    #[test]
    fn parses_layout_base_and_module_entry_from_json() {
        let json = r#"{
            "base": {"layout": "base-oci"},
            "source": {"path": "app", "dest": "/app"},
            "entry": {"module": "app.app"},
            "workdir": "/"
        }"#;
        let spec = BuildSpec::from_json_str(json).unwrap();
        spec.validate().unwrap();

        assert_eq!(spec.base, BaseSpec::Layout(PathBuf::from("base-oci")));
        assert_eq!(spec.base_reference().unwrap(), None);
        assert_eq!(spec.entry_argv(), vec!["python", "-m", "app.app"]);
        assert_eq!(spec.workdir().unwrap().as_deref(), Some("/"));
    }

    #[test]
    fn load_picks_parser_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.yml");
        std::fs::write(&path, SCRIPT_BUILD).unwrap();
        assert!(BuildSpec::load(&path).is_ok());

        let err = BuildSpec::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.is_user_error());
    }
}
