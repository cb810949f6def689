use anyhow::Result;
use std::sync::Arc;

use crate::commands::{CommandReport, vault_context};
use crate::error::CleanupConflict;
use crate::vault::cleanup::{
    CleanupJobs, CleanupSettings, JobSnapshot, JobStatus, build_probe, parse_providers,
};
use crate::vault::paths::resolve_paths;

fn snapshot_details(report: &mut CommandReport, snapshot: &JobSnapshot) {
    report.detail(format!("status={}", status_label(snapshot.status)));
    if !snapshot.job_id.is_empty() {
        report.detail(format!("job_id={}", snapshot.job_id));
    }
    if !snapshot.providers.is_empty() {
        report.detail(format!(
            "providers={}",
            snapshot
                .providers
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(",")
        ));
    }
    if let Some(after) = snapshot.resumed_from {
        report.detail(format!("resumed_after_entry={after}"));
    }
    report.detail(format!("scanned={}", snapshot.scanned));
    report.detail(format!("candidate={}", snapshot.candidate));
    report.detail(format!("deleted={}", snapshot.deleted));
    report.detail(format!("checked_links={}", snapshot.checked_links));
    report.detail(format!("cached_links={}", snapshot.cached_links));
    report.detail(format!("errors={}", snapshot.errors));
    if snapshot.stop_requested {
        report.detail("stop_requested=true");
    }
    if let Some(err) = snapshot.last_error.as_deref() {
        report.detail(format!("last_error={err}"));
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Idle => "idle",
        JobStatus::Running => "running",
        JobStatus::Done => "done",
        JobStatus::Error => "error",
    }
}

/// Start a cleanup for `source_id` and wait for it in the foreground.
pub fn run(source_id: &str, providers: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("cleanup-run");
    let (paths, cfg) = vault_context()?;
    let providers = parse_providers(providers)?;
    let probe = Arc::from(build_probe(&cfg)?);
    report.detail(format!("source={source_id}"));
    report.detail(format!("probe={}", cfg.cleanup.probe));

    let jobs = CleanupJobs::new(paths);
    let started = jobs.start(
        source_id,
        providers,
        CleanupSettings::from(&cfg.cleanup),
        probe,
    );
    if let Err(err) = started {
        let conflict = err.downcast::<CleanupConflict>()?;
        report.issue(format!("{}: {conflict}", conflict.code().as_str()));
        if let Some(existing) = conflict.snapshot() {
            snapshot_details(&mut report, existing);
            report.attach(existing)?;
        }
        return Ok(report);
    }

    let finished = jobs.wait(source_id);
    snapshot_details(&mut report, &finished);
    if finished.status == JobStatus::Error {
        report.issue(format!(
            "cleanup failed: {}",
            finished.last_error.as_deref().unwrap_or("unknown error")
        ));
    }
    report.attach(&finished)?;
    Ok(report)
}

pub fn status(source_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("cleanup-status");
    let paths = resolve_paths()?;
    let snapshot = CleanupJobs::new(paths).status(source_id);
    report.detail(format!("source={source_id}"));
    snapshot_details(&mut report, &snapshot);
    report.attach(&snapshot)?;
    Ok(report)
}

pub fn stop(source_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("cleanup-stop");
    let paths = resolve_paths()?;
    report.detail(format!("source={source_id}"));
    if CleanupJobs::new(paths).request_stop(source_id)? {
        report.detail("stop requested; the job ends at the next entry boundary");
    } else {
        report.detail("no cleanup running");
    }
    Ok(report)
}
