use anyhow::Result;

use crate::commands::{CommandReport, ensure_tdl_available, vault_context};
use crate::vault::capture;
use crate::vault::sources;

pub fn run(source_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("resync");
    let (paths, cfg) = vault_context()?;
    let source = sources::require(&paths, source_id)?;
    report.detail(format!("source={}", source.id));

    if !ensure_tdl_available(&mut report) {
        return Ok(report);
    }

    match capture::resync(&paths, &cfg, &source) {
        Ok(outcome) => {
            report.detail(format!("records={}", outcome.records));
            report.detail(format!("reactions_refreshed={}", outcome.refreshed));
            if outcome.downloaded == Some(false) {
                report.detail("download=failed (attachments may be missing)");
            }
            report.attach(&outcome)?;
        }
        Err(err) => report.issue(format!("resync failed: {err:#}")),
    }
    Ok(report)
}
