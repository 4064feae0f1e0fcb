//! Entry command declared for the produced image.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// The single default process of the image.
///
/// Serialised as `entry: { script: /src/main.py }` or
/// `entry: { module: app.app }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCommand {
    /// `python <path>`
    Script(String),
    /// `python -m <module>`
    Module(String),
}

fn module_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("static regex is valid")
    })
}

impl EntryCommand {
    /// Render the command as an argv vector for the OCI `Cmd` field.
    pub fn argv(&self, interpreter: &str) -> Vec<String> {
        match self {
            EntryCommand::Script(path) => vec![interpreter.to_string(), path.clone()],
            EntryCommand::Module(name) => {
                vec![interpreter.to_string(), "-m".to_string(), name.clone()]
            }
        }
    }

    pub fn validate(&self) -> BoxforgeResult<()> {
        match self {
            EntryCommand::Script(path) => {
                if !path.starts_with('/') {
                    return Err(BoxforgeError::Config(format!(
                        "Entry script '{}' must be an absolute path inside the image",
                        path
                    )));
                }
                if path.ends_with('/') {
                    return Err(BoxforgeError::Config(format!(
                        "Entry script '{}' names a directory",
                        path
                    )));
                }
            }
            EntryCommand::Module(name) => {
                if !module_name_re().is_match(name) {
                    return Err(BoxforgeError::Config(format!(
                        "Entry module '{}' is not a dotted Python module name",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Candidate files (relative to the working directory for modules) that
    /// would satisfy this command. Used for a best-effort presence check.
    pub fn expected_files(&self, workdir: &str) -> Vec<String> {
        match self {
            EntryCommand::Script(path) => vec![path.clone()],
            EntryCommand::Module(name) => {
                let rel = name.replace('.', "/");
                let base = workdir.trim_end_matches('/');
                vec![
                    format!("{}/{}.py", base, rel),
                    format!("{}/{}/__main__.py", base, rel),
                ]
            }
        }
    }
}

impl std::fmt::Display for EntryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryCommand::Script(path) => write!(f, "script {}", path),
            EntryCommand::Module(name) => write!(f, "module {}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_argv() {
        let entry = EntryCommand::Script("/src/main.py".into());
        assert_eq!(entry.argv("python"), vec!["python", "/src/main.py"]);
    }

    #[test]
    fn module_argv() {
        let entry = EntryCommand::Module("app.app".into());
        assert_eq!(entry.argv("python"), vec!["python", "-m", "app.app"]);
    }

    #[test]
    fn validates_module_names() {
        assert!(EntryCommand::Module("app.app".into()).validate().is_ok());
        assert!(EntryCommand::Module("_private.mod2".into()).validate().is_ok());
        assert!(EntryCommand::Module("app..app".into()).validate().is_err());
        assert!(EntryCommand::Module("1app".into()).validate().is_err());
        assert!(EntryCommand::Module("app/app".into()).validate().is_err());
    }

    #[test]
    fn validates_script_paths() {
        assert!(EntryCommand::Script("/src/main.py".into()).validate().is_ok());
        assert!(EntryCommand::Script("main.py".into()).validate().is_err());
        assert!(EntryCommand::Script("/src/".into()).validate().is_err());
    }

    #[test]
    fn module_expected_files() {
        let entry = EntryCommand::Module("app.app".into());
        assert_eq!(
            entry.expected_files("/"),
            vec!["/app/app.py".to_string(), "/app/app/__main__.py".to_string()]
        );
    }

    #[derive(Deserialize)]
    struct Holder {
        #[serde(with = "serde_yaml::with::singleton_map")]
        entry: EntryCommand,
    }

    #[test]
    fn deserializes_from_yaml_map() {
        let holder: Holder = serde_yaml::from_str("entry:\n  module: app.app\n").unwrap();
        assert_eq!(holder.entry, EntryCommand::Module("app.app".into()));

        let holder: Holder = serde_yaml::from_str("entry: {script: /src/main.py}").unwrap();
        assert_eq!(holder.entry, EntryCommand::Script("/src/main.py".into()));
    }
}
