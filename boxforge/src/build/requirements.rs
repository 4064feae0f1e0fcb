//! Dependency manifest (requirements.txt) parsing.
//!
//! The installer is the authority on what a manifest means; this parser only
//! extracts enough structure for validation output and build logs: package
//! names, their constraints, and options that reference other files.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;

/// A single `name[extras] <constraint> ; marker` line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Requirement {
    /// Canonical (PEP 503) project name
    pub name: String,
    /// Version constraint as written, e.g. `==2.31.0` or `>=1,<2`
    pub constraint: String,
    /// Environment marker after `;`, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// 1-based line number in the manifest
    pub line: usize,
}

impl Requirement {
    /// True when the constraint selects exactly one version.
    pub fn is_pinned(&self) -> bool {
        let c = self.constraint.trim();
        (c.starts_with("==") || c.starts_with("===")) && !c.contains('*') && !c.contains(',')
    }
}

/// Parsed dependency manifest.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DependencyManifest {
    pub requirements: Vec<Requirement>,
    /// Option lines such as `--index-url ...` or `-r other.txt`
    pub options: Vec<String>,
}

fn requirement_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(\[[^\]]*\])?\s*(.*)$")
            .expect("static regex is valid")
    })
}

/// PEP 503 name normalisation.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c == '-' || c == '_' || c == '.' {
            if !last_dash {
                out.push('-');
            }
            last_dash = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        }
    }
    out
}

fn strip_comment(line: &str) -> &str {
    // A '#' starts a comment at line start or after whitespace; URL fragments
    // like `pkg @ https://host/x#egg=pkg` are left alone.
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

impl DependencyManifest {
    pub fn parse(content: &str) -> BoxforgeResult<Self> {
        let mut manifest = DependencyManifest::default();
        let mut pending = String::new();
        let mut pending_line = 0;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let stripped = strip_comment(raw).trim_end();

            if pending.is_empty() {
                pending_line = line_no;
            }

            if let Some(continued) = stripped.strip_suffix('\\') {
                pending.push_str(continued);
                pending.push(' ');
                continue;
            }
            pending.push_str(stripped);

            let logical = std::mem::take(&mut pending);
            let logical = logical.trim();
            if logical.is_empty() {
                continue;
            }

            if logical.starts_with('-') {
                manifest.options.push(logical.to_string());
                continue;
            }

            manifest
                .requirements
                .push(Self::parse_requirement(logical, pending_line)?);
        }

        Ok(manifest)
    }

    fn parse_requirement(line: &str, line_no: usize) -> BoxforgeResult<Requirement> {
        let (spec, marker) = match line.split_once(';') {
            Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
            None => (line, None),
        };

        let caps = requirement_re().captures(spec).ok_or_else(|| {
            BoxforgeError::Config(format!(
                "Invalid requirement on line {}: '{}'",
                line_no, line
            ))
        })?;

        let name = canonical_name(&caps[1]);
        let constraint = caps
            .get(3)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        Ok(Requirement {
            name,
            constraint,
            marker,
            line: line_no,
        })
    }

    pub fn load(path: &Path) -> BoxforgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BoxforgeError::Config(format!(
                "Failed to read dependency manifest {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Requirements that do not select a single version.
    pub fn unpinned(&self) -> impl Iterator<Item = &Requirement> {
        self.requirements.iter().filter(|r| !r.is_pinned())
    }

    /// Options that pull in other files (`-r`, `-c`), which are not copied
    /// into the image and therefore cannot resolve during installation.
    pub fn file_includes(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter(|o| {
                o.starts_with("-r")
                    || o.starts_with("-c")
                    || o.starts_with("--requirement")
                    || o.starts_with("--constraint")
            })
            .map(String::as_str)
            .collect()
    }
}
