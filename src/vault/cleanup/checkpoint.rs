use super::links::Provider;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Resume point of an interrupted cleanup scan.
///
/// Scans run in ascending entry id order, so the last entry id of a
/// committed batch is a stable boundary even after rows are deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCheckpoint {
    pub providers: Vec<Provider>,
    pub after_entry_id: i64,
    pub scanned: u64,
    pub committed_at: u64,
}

/// Load a checkpoint, treating an unreadable file as absent.
pub fn load(path: &Path) -> Option<CleanupCheckpoint> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(checkpoint) => Some(checkpoint),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring corrupt cleanup checkpoint");
            None
        }
    }
}

/// Checkpoint to resume from, if one exists for exactly this provider set.
pub fn resumable(path: &Path, providers: &[Provider]) -> Option<CleanupCheckpoint> {
    load(path).filter(|cp| cp.providers == providers)
}

pub fn save(path: &Path, checkpoint: &CleanupCheckpoint) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(checkpoint)?)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn clear(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
