//! Name-pattern selection of optional input files.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};

/// Matches file names directly inside one directory.
#[derive(Clone, Debug)]
pub struct FilePattern {
    pattern: Pattern,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl FilePattern {
    pub fn new(pattern: &str) -> BoxforgeResult<Self> {
        let pattern = Pattern::new(pattern).map_err(|e| {
            BoxforgeError::Config(format!("Invalid file pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.matches_with(name, MATCH_OPTIONS)
    }

    /// Regular files in `dir` whose names match, sorted by name.
    ///
    /// Zero matches is not an error. A missing `dir` is, since it is the
    /// build context itself.
    pub fn collect(&self, dir: &Path) -> BoxforgeResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            BoxforgeError::Storage(format!("Failed to read directory {}: {}", dir.display(), e))
        })?;

        let mut matched = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                BoxforgeError::Storage(format!("Failed to read entry in {}: {}", dir.display(), e))
            })?;

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                tracing::debug!(name = ?entry.file_name(), "Skipping non UTF-8 file name");
                continue;
            };

            if !self.matches(name) {
                continue;
            }

            // Follows symlinks: a link to a regular file is copied as its content.
            match std::fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => matched.push(entry.path()),
                Ok(_) => {
                    tracing::debug!(path = %entry.path().display(), "Skipping non-file match");
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Skipping unreadable match");
                }
            }
        }

        matched.sort();
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn env_prefix_pattern() {
        let p = FilePattern::new(".env*").unwrap();
        assert!(p.matches(".env"));
        assert!(p.matches(".env.production"));
        assert!(!p.matches("env"));
        assert!(!p.matches("x.env"));
    }

    #[test]
    fn collects_sorted_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env.b"), "B=1").unwrap();
        std::fs::write(dir.path().join(".env"), "A=1").unwrap();
        std::fs::write(dir.path().join("main.py"), "").unwrap();
        std::fs::create_dir(dir.path().join(".envs")).unwrap();

        let p = FilePattern::new(".env*").unwrap();
        let names: Vec<_> = p
            .collect(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec![".env", ".env.b"]);
    }

    #[test]
    fn zero_matches_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = FilePattern::new(".env*").unwrap();
        assert!(p.collect(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        assert!(FilePattern::new("[").unwrap_err().is_user_error());
    }

    proptest! {
        #[test]
        fn prefix_star_matches_any_suffix(suffix in "[A-Za-z0-9._-]{0,16}") {
            let p = FilePattern::new(".env*").unwrap();
            let name = format!(".env{}", suffix);
            prop_assert!(p.matches(&name));
        }

        #[test]
        fn literal_pattern_matches_only_itself(name in "[a-z]{1,8}", other in "[a-z]{1,8}") {
            let p = FilePattern::new(&name).unwrap();
            prop_assert_eq!(p.matches(&other), name == other);
        }
    }
}
