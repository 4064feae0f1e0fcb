//! Stage 7: declare the entry command.
//!
//! Derives the runtime settings of the produced image. The declared command
//! becomes `Cmd` and the base `Entrypoint` is cleared, so it is the only
//! default process.

use crate::assembly::types::LayerStep;
use crate::build::{BuildSpec, EntryCommand, image_path_in};
use crate::images::{BaseImage, HistoryEntry, RuntimeSettings};
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};

pub struct EntrypointInput<'a> {
    pub spec: &'a BuildSpec,
    pub base: &'a BaseImage,
    /// Layers written by earlier stages, bottom to top
    pub layers: &'a [LayerStep],
}

pub struct EntrypointOutput {
    pub settings: RuntimeSettings,
    pub history: HistoryEntry,
}

pub fn run(input: EntrypointInput<'_>) -> BoxforgeResult<EntrypointOutput> {
    let spec = input.spec;
    let cmd = spec.entry_argv();
    let workdir = spec.workdir()?;

    let effective_workdir = workdir
        .clone()
        .or_else(|| {
            input
                .base
                .config
                .config()
                .as_ref()
                .and_then(|c| c.working_dir().clone())
        })
        .filter(|w| !w.is_empty())
        .unwrap_or_else(|| "/".to_string());

    check_entry_present(&spec.entry, &effective_workdir, input.layers);

    let settings = RuntimeSettings {
        cmd: cmd.clone(),
        workdir,
        env: spec.env.clone(),
        labels: spec.labels.clone(),
        created: epoch_rfc3339(spec.source_date_epoch)?,
    };

    tracing::info!(step = "entrypoint", cmd = ?cmd, "Entry command declared");

    let rendered = serde_json::to_string(&cmd)?;
    Ok(EntrypointOutput {
        settings,
        history: HistoryEntry {
            created_by: format!("boxforge: CMD {}", rendered),
            comment: None,
            empty_layer: true,
        },
    })
}

/// RFC 3339 timestamp for `epoch` seconds, e.g. `1970-01-01T00:00:00Z`.
pub fn epoch_rfc3339(epoch: u64) -> BoxforgeResult<String> {
    let secs = i64::try_from(epoch)
        .map_err(|_| BoxforgeError::Config(format!("source_date_epoch {} is out of range", epoch)))?;
    let time = chrono::DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        BoxforgeError::Config(format!("source_date_epoch {} is out of range", epoch))
    })?;
    Ok(time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
}

// The file may also come from the base image or an installed package, so
// absence only warrants a warning.
fn check_entry_present(entry: &EntryCommand, workdir: &str, layers: &[LayerStep]) {
    let candidates = entry.expected_files(workdir);
    let found = candidates
        .iter()
        .any(|f| layers.iter().any(|l| image_path_in(&l.dir, f).is_file()));

    if !found {
        tracing::warn!(
            entry = %entry,
            candidates = ?candidates,
            "Entry command target not found in the copied inputs"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_formats() {
        assert_eq!(epoch_rfc3339(0).unwrap(), "1970-01-01T00:00:00Z");
        assert_eq!(epoch_rfc3339(1_700_000_000).unwrap(), "2023-11-14T22:13:20Z");
        assert!(epoch_rfc3339(u64::MAX).unwrap_err().is_user_error());
    }
}
