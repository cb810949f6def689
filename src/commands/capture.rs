use anyhow::Result;

use crate::commands::{CommandReport, ensure_tdl_available, vault_context};
use crate::vault::capture;
use crate::vault::sources;

pub fn run(source_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("capture");
    let (paths, cfg) = vault_context()?;
    let source = sources::require(&paths, source_id)?;
    report.detail(format!("source={}", source.id));
    report.detail(format!("archive={}", paths.archive_db(&source.id).display()));

    if !ensure_tdl_available(&mut report) {
        return Ok(report);
    }

    let outcome = match capture::capture(&paths, &cfg, &source) {
        Ok(outcome) => outcome,
        Err(err) => {
            report.issue(format!("capture failed: {err:#}"));
            return Ok(report);
        }
    };
    report.detail(format!(
        "window={}..{}",
        outcome.window_start, outcome.window_end
    ));
    report.detail(format!("records={}", outcome.records));
    report.detail(format!("entries={}", outcome.entries));
    report.detail(format!("inserted={}", outcome.inserted));
    match outcome.downloaded {
        Some(true) => report.detail("download=ok"),
        Some(false) => report.detail("download=failed (attachments may be missing)"),
        None => report.detail("download=disabled"),
    }
    report.detail(format!("cursor={}", outcome.cursor));
    report.attach(&outcome)?;
    Ok(report)
}
