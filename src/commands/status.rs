use anyhow::Result;
use serde::Serialize;

use crate::commands::{CommandReport, vault_context};
use crate::vault::cleanup::{CleanupJobs, JobStatus};
use crate::vault::scheduler::marker_status;
use crate::vault::sources;
use crate::vault::store::{ArchiveStore, CaptureCursor};

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub label: String,
    pub archived: bool,
    pub entries: u64,
    pub cursor: Option<CaptureCursor>,
    pub pending_batch: bool,
    pub cleanup: JobStatus,
}

pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let (paths, cfg) = vault_context()?;

    report.detail(format!("vault_home={}", paths.vault_home.display()));
    report.detail(format!("data_dir={}", paths.data_dir.display()));
    report.detail(format!("downloads_dir={}", paths.downloads_dir.display()));
    report.detail(format!("capture.interval_secs={}", cfg.capture.interval_secs));
    report.detail(format!("capture.timezone={}", cfg.capture.timezone));
    report.detail(format!("cleanup.probe={}", cfg.cleanup.probe));

    match crate::tdl::resolve_tdl_bin() {
        Ok(bin) => report.detail(format!("tdl_bin={}", bin.display())),
        Err(err) => report.detail(format!("tdl_bin=unavailable ({err:#})")),
    }

    let workers = marker_status(&paths.workers_marker())?;
    report.detail(format!("workers_enabled={}", workers.held));
    if let Some(pid) = workers.holder_pid {
        report.detail(format!("workers_pid={pid}"));
    }

    let jobs = CleanupJobs::new(paths.clone());
    let mut statuses = Vec::new();
    for source in sources::load(&paths)? {
        let store = match ArchiveStore::open_existing(&paths, &source.id) {
            Ok(store) => store,
            Err(err) => {
                report.issue(format!("source {}: archive unreadable: {err:#}", source.id));
                continue;
            }
        };
        let (entries, cursor) = match store {
            Some(store) => (store.count()?, Some(store.cursor()?)),
            None => (0, None),
        };
        let status = SourceStatus {
            id: source.id.clone(),
            label: source.label().to_string(),
            archived: cursor.is_some(),
            entries,
            cursor,
            pending_batch: paths.pending_batch(&source.id).exists(),
            cleanup: jobs.status(&source.id).status,
        };
        report.detail(format!(
            "source={} label={} entries={} last_export_time={} pending_batch={} cleanup={:?}",
            status.id,
            status.label,
            status.entries,
            status
                .cursor
                .as_ref()
                .map(|c| c.last_export_time.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.pending_batch,
            status.cleanup
        ));
        statuses.push(status);
    }
    report.detail(format!("sources={}", statuses.len()));
    report.attach(&statuses)?;
    Ok(report)
}
