//! Image configuration editing.
//!
//! The produced config starts from the base image's and changes only what
//! the build declares: the default process, working directory, extra
//! environment and labels, the layer list and the history.

use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};
use oci_spec::image::{Config, ImageConfiguration};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Runtime settings declared by a build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Default process argv (becomes `Cmd`; `Entrypoint` is cleared)
    pub cmd: Vec<String>,
    pub workdir: Option<String>,
    /// Merged over the base env, sorted by key
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// RFC 3339 creation time for the config and new history entries
    pub created: String,
}

/// One history record appended for a build step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub created_by: String,
    pub comment: Option<String>,
    /// True when the step produced no layer
    pub empty_layer: bool,
}

/// Derive the new image config from `base`.
///
/// `diff_ids` is the complete layer list (base layers first). The result is
/// a JSON value ready for canonical serialisation.
pub fn apply_runtime_settings(
    base: &ImageConfiguration,
    settings: &RuntimeSettings,
    diff_ids: Vec<String>,
    history: &[HistoryEntry],
) -> BoxforgeResult<serde_json::Value> {
    let mut image = base.clone();
    let mut config: Config = base.config().clone().unwrap_or_default();

    config.set_cmd(Some(settings.cmd.clone()));
    config.set_entrypoint(None);
    let env = merge_env(config.env().as_deref().unwrap_or_default(), &settings.env);
    config.set_env(Some(env));

    if let Some(workdir) = &settings.workdir {
        config.set_working_dir(Some(workdir.clone()));
    }

    if !settings.labels.is_empty() {
        let mut labels: HashMap<String, String> = config.labels().clone().unwrap_or_default();
        labels.extend(settings.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        config.set_labels(Some(labels));
    }

    image.set_config(Some(config));

    let mut rootfs = image.rootfs().clone();
    rootfs.set_diff_ids(diff_ids);
    image.set_rootfs(rootfs);
    image.set_created(Some(settings.created.clone()));

    let mut value = serde_json::to_value(&image)
        .map_err(|e| BoxforgeError::Internal(format!("Failed to serialize image config: {}", e)))?;

    let object = value
        .as_object_mut()
        .ok_or_else(|| BoxforgeError::Internal("Image config is not a JSON object".into()))?;
    let entries = object
        .entry("history")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if entries.is_null() {
        *entries = serde_json::Value::Array(Vec::new());
    }
    let entries = entries
        .as_array_mut()
        .ok_or_else(|| BoxforgeError::Image("Base image history is not a list".into()))?;

    for entry in history {
        let mut record = serde_json::Map::new();
        record.insert("created".into(), settings.created.clone().into());
        record.insert("created_by".into(), entry.created_by.clone().into());
        if let Some(comment) = &entry.comment {
            record.insert("comment".into(), comment.clone().into());
        }
        if entry.empty_layer {
            record.insert("empty_layer".into(), true.into());
        }
        entries.push(serde_json::Value::Object(record));
    }

    Ok(value)
}

/// Merge `KEY=VALUE` entries with overrides; output sorted by key.
pub fn merge_env(base: &[String], overrides: &BTreeMap<String, String>) -> Vec<String> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for entry in base {
        match entry.split_once('=') {
            Some((k, v)) => merged.insert(k.to_string(), v.to_string()),
            None => merged.insert(entry.clone(), String::new()),
        };
    }
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

/// Flattened view of an image config for display.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ConfigSummary {
    pub os: String,
    pub architecture: String,
    pub created: Option<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
}

pub fn config_summary(image: &ImageConfiguration) -> ConfigSummary {
    let config = image.config().clone().unwrap_or_default();
    ConfigSummary {
        os: image.os().to_string(),
        architecture: image.architecture().to_string(),
        created: image.created().clone(),
        cmd: config.cmd().clone().unwrap_or_default(),
        entrypoint: config.entrypoint().clone().unwrap_or_default(),
        env: config.env().clone().unwrap_or_default(),
        working_dir: config.working_dir().clone(),
        labels: config
            .labels()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect(),
    }
}
