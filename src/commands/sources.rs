use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::commands::{CommandReport, ensure_tdl_available, vault_context};
use crate::tdl::{CaptureTool, TdlCli};
use crate::vault::paths::{contained_join, resolve_paths};
use crate::vault::sources::{self, SourceConfig};

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub remark: Option<String>,
    pub no_download: bool,
    pub images_only: bool,
    pub recent_only: bool,
    pub plain: bool,
    /// Resolve the id or username through the capture tool first.
    pub lookup: bool,
}

pub fn add(source: &str, opts: &AddOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("sources-add");
    let (paths, cfg) = vault_context()?;

    let mut id = source.trim().to_string();
    let mut remark = opts.remark.clone();
    if opts.lookup {
        if !ensure_tdl_available(&mut report) {
            return Ok(report);
        }
        let timeout = Some(cfg.capture.tool_timeout_secs).filter(|s| *s > 0);
        match TdlCli::from_env(timeout)?.lookup(&id)? {
            Some(listing) => {
                report.detail(format!("resolved {id} -> {} ({})", listing.id, listing.visible_name));
                id = listing.id;
                if remark.is_none() && !listing.visible_name.is_empty() {
                    remark = Some(listing.visible_name);
                }
            }
            None => {
                report.issue(format!("no chat matches `{id}`"));
                return Ok(report);
            }
        }
    }

    let mut entry = SourceConfig::new(id);
    entry.remark = remark;
    entry.download_files = !opts.no_download;
    entry.download_images_only = opts.images_only;
    entry.all_messages = !opts.recent_only;
    entry.raw_messages = !opts.plain;

    let created = sources::upsert(&paths, entry.clone())?;
    report.detail(format!(
        "{} source {}",
        if created { "added" } else { "updated" },
        entry.id
    ));
    report.detail(format!("sources_file={}", paths.sources_file.display()));
    report.attach(&entry)?;
    Ok(report)
}

pub fn list() -> Result<CommandReport> {
    let mut report = CommandReport::new("sources-list");
    let paths = resolve_paths()?;
    let configured = sources::load(&paths)?;
    report.detail(format!("sources={}", configured.len()));
    for source in &configured {
        report.detail(format!(
            "source={} remark={} download={} images_only={}",
            source.id,
            source.remark.as_deref().unwrap_or("-"),
            source.download_files,
            source.download_images_only
        ));
    }
    report.attach(&configured)?;
    Ok(report)
}

fn remove_tree(base: &Path, source_id: &str, report: &mut CommandReport) -> Result<()> {
    let Some(target) = contained_join(base, source_id) else {
        report.issue(format!(
            "refusing to delete `{source_id}` under {}",
            base.display()
        ));
        return Ok(());
    };
    if !target.exists() {
        return Ok(());
    }
    fs::remove_dir_all(&target)
        .with_context(|| format!("failed to remove {}", target.display()))?;
    report.detail(format!("removed {}", target.display()));
    Ok(())
}

/// Drop the source from the registry together with its archive and downloads.
pub fn remove(source_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("sources-remove");
    let paths = resolve_paths()?;
    if !sources::remove(&paths, source_id)? {
        report.issue(format!("source {source_id} is not configured"));
        return Ok(report);
    }
    report.detail(format!("removed source {source_id}"));
    remove_tree(&paths.data_dir, source_id, &mut report)?;
    remove_tree(&paths.downloads_dir, source_id, &mut report)?;
    Ok(report)
}
