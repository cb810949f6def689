use crate::error::VaultError;
use crate::vault::paths::VaultPaths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// One configured capture source, as persisted in `sources.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub id: String,
    pub remark: Option<String>,
    pub download_files: bool,
    pub download_images_only: bool,
    pub all_messages: bool,
    pub raw_messages: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            remark: None,
            download_files: true,
            download_images_only: false,
            all_messages: true,
            raw_messages: true,
        }
    }
}

impl SourceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Label used in log lines: the remark when set, else the id.
    pub fn label(&self) -> &str {
        match self.remark.as_deref() {
            Some(remark) if !remark.trim().is_empty() => remark,
            _ => &self.id,
        }
    }

    fn normalized(mut self) -> Self {
        self.id = self.id.trim().to_string();
        if self.download_images_only {
            self.download_files = true;
        }
        self
    }
}

pub fn load(paths: &VaultPaths) -> Result<Vec<SourceConfig>> {
    let file = &paths.sources_file;
    if !file.exists() {
        return Ok(Vec::new());
    }

    let raw =
        fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Vec<SourceConfig> = serde_json::from_str(&raw)
        .map_err(|err| VaultError::StateCorrupt(format!("{}: {err}", file.display())))?;
    Ok(parsed
        .into_iter()
        .map(SourceConfig::normalized)
        .filter(|s| !s.id.is_empty())
        .collect())
}

pub fn save(paths: &VaultPaths, sources: &[SourceConfig]) -> Result<PathBuf> {
    let file = paths.sources_file.clone();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(sources)?;
    fs::write(&file, format!("{data}\n"))
        .with_context(|| format!("failed to write {}", file.display()))?;
    Ok(file)
}

pub fn find(paths: &VaultPaths, source_id: &str) -> Result<Option<SourceConfig>> {
    Ok(load(paths)?.into_iter().find(|s| s.id == source_id))
}

/// Like [`find`], but an unconfigured id is an error.
pub fn require(paths: &VaultPaths, source_id: &str) -> Result<SourceConfig> {
    find(paths, source_id)?.ok_or_else(|| VaultError::UnknownSource(source_id.to_string()).into())
}

/// Insert or replace by id. Returns `true` when the source was new.
pub fn upsert(paths: &VaultPaths, source: SourceConfig) -> Result<bool> {
    let source = source.normalized();
    if source.id.is_empty() {
        anyhow::bail!("source id cannot be empty");
    }
    let mut all = load(paths)?;
    let created = match all.iter_mut().find(|s| s.id == source.id) {
        Some(existing) => {
            *existing = source;
            false
        }
        None => {
            all.push(source);
            true
        }
    };
    save(paths, &all)?;
    Ok(created)
}

/// Remove by id. Returns `true` when an entry was dropped.
pub fn remove(paths: &VaultPaths, source_id: &str) -> Result<bool> {
    let mut all = load(paths)?;
    let before = all.len();
    all.retain(|s| s.id != source_id);
    let removed = all.len() != before;
    if removed {
        save(paths, &all)?;
    }
    Ok(removed)
}
