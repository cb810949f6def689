//! One incremental capture cycle for a source, plus the full-window resync.

use crate::tdl::{CaptureTool, TdlCli};
use crate::vault::audit;
use crate::vault::batch::{decode_records, merge_into_pending, read_batch};
use crate::vault::config::VaultConfig;
use crate::vault::normalize::normalize;
use crate::vault::paths::VaultPaths;
use crate::vault::sources::SourceConfig;
use crate::vault::store::ArchiveStore;
use crate::vault::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct CaptureOutcome {
    pub source_id: String,
    pub window_start: u64,
    pub window_end: u64,
    /// Records decoded from the merged batch.
    pub records: usize,
    /// Entries after album grouping.
    pub entries: usize,
    pub inserted: usize,
    /// `None` when the source does not download files.
    pub downloaded: Option<bool>,
    pub cursor: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResyncOutcome {
    pub source_id: String,
    pub records: usize,
    pub refreshed: usize,
    pub downloaded: Option<bool>,
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn tool_timeout(cfg: &VaultConfig) -> Option<u64> {
    Some(cfg.capture.tool_timeout_secs).filter(|secs| *secs > 0)
}

fn run_download(
    paths: &VaultPaths,
    source: &SourceConfig,
    tool: &dyn CaptureTool,
    batch: &Path,
) -> Option<bool> {
    if !source.download_files {
        return None;
    }
    let dest = paths.source_downloads_dir(&source.id);
    match tool.download(source, batch, &dest) {
        Ok(()) => Some(true),
        Err(err) => {
            // Attachments are best effort; the records are still archived.
            tracing::warn!(source = %source.label(), error = %format!("{err:#}"), "download failed");
            Some(false)
        }
    }
}

/// Capture `[cursor, now)` for `source` with an explicit tool and clock.
///
/// The cursor only moves after the store write succeeds. A tool failure
/// leaves the archive, the cursor and any pending batch untouched.
pub fn capture_with(
    paths: &VaultPaths,
    cfg: &VaultConfig,
    source: &SourceConfig,
    tool: &dyn CaptureTool,
    now: u64,
) -> Result<CaptureOutcome> {
    let tz = cfg.timezone()?;
    let store = ArchiveStore::open(paths, &source.id)?;
    let window_start = store.cursor()?.last_export_time;
    let window_end = now;

    let fresh = paths.export_batch(&source.id);
    let pending = paths.pending_batch(&source.id);
    remove_if_exists(&fresh)?;

    tracing::info!(source = %source.label(), window_start, window_end, "capture starting");
    if let Err(err) = tool.export(source, window_start, window_end, &fresh) {
        let _ = remove_if_exists(&fresh);
        return Err(err.context(format!("export failed for source {}", source.id)));
    }
    let downloaded = run_download(paths, source, tool, &fresh);

    let merged = merge_into_pending(&pending, &fresh, &source.id)?;
    remove_if_exists(&fresh)?;
    store.mark_exported(now)?;

    let records = decode_records(merged.messages);
    let record_count = records.len();
    let entries = normalize(&source.id, records, tz);
    let inserted = store
        .insert_entries(&entries)
        .with_context(|| format!("failed to store entries for source {}", source.id))?;

    let cursor = store.advance_cursor(window_end)?;
    remove_if_exists(&pending)?;

    tracing::info!(
        source = %source.label(),
        records = record_count,
        entries = entries.len(),
        inserted,
        cursor,
        "capture finished"
    );
    audit::record(
        paths,
        "capture",
        "ok",
        &format!(
            "source={} window={window_start},{window_end} records={record_count} inserted={inserted}",
            source.id
        ),
    );

    Ok(CaptureOutcome {
        source_id: source.id.clone(),
        window_start,
        window_end,
        records: record_count,
        entries: entries.len(),
        inserted,
        downloaded,
        cursor,
    })
}

pub fn capture(paths: &VaultPaths, cfg: &VaultConfig, source: &SourceConfig) -> Result<CaptureOutcome> {
    let tool = TdlCli::from_env(tool_timeout(cfg))?;
    capture_with(paths, cfg, source, &tool, now_epoch_secs()?)
}

/// Export the whole history again to fetch missing attachments and refresh
/// reaction counts of archived entries. Never inserts and never moves the
/// cursor.
pub fn resync_with(
    paths: &VaultPaths,
    source: &SourceConfig,
    tool: &dyn CaptureTool,
    now: u64,
) -> Result<ResyncOutcome> {
    let store = ArchiveStore::open(paths, &source.id)?;
    let batch_path = paths.resync_batch(&source.id);
    remove_if_exists(&batch_path)?;

    tracing::info!(source = %source.label(), "resync starting");
    let result = (|| -> Result<ResyncOutcome> {
        tool.export(source, 0, now, &batch_path)
            .with_context(|| format!("resync export failed for source {}", source.id))?;
        let downloaded = run_download(paths, source, tool, &batch_path);
        let records = decode_records(read_batch(&batch_path)?.messages);
        let updates = records
            .iter()
            .map(|r| (r.entry_id, r.reactions.clone()))
            .collect::<Vec<_>>();
        let refreshed = store.refresh_reactions(&updates)?;
        Ok(ResyncOutcome {
            source_id: source.id.clone(),
            records: records.len(),
            refreshed,
            downloaded,
        })
    })();
    let _ = remove_if_exists(&batch_path);

    let outcome = result?;
    tracing::info!(
        source = %source.label(),
        records = outcome.records,
        refreshed = outcome.refreshed,
        "resync finished"
    );
    audit::record(
        paths,
        "resync",
        "ok",
        &format!("source={} refreshed={}", source.id, outcome.refreshed),
    );
    Ok(outcome)
}

pub fn resync(paths: &VaultPaths, cfg: &VaultConfig, source: &SourceConfig) -> Result<ResyncOutcome> {
    let tool = TdlCli::from_env(tool_timeout(cfg))?;
    resync_with(paths, source, &tool, now_epoch_secs()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{capture_with, resync_with};
    use crate::tdl::{CaptureTool, ChatListing};
    use crate::vault::batch::{ExportBatch, write_batch};
    use crate::vault::config::VaultConfig;
    use crate::vault::paths::VaultPaths;
    use crate::vault::sources::SourceConfig;
    use crate::vault::store::ArchiveStore;
    use crate::vault::util::lock_unpoisoned;
    use anyhow::Result;
    use serde_json::{Value, json};
    use std::path::Path;
    use std::sync::Mutex;

    /// Writes a fixed list of messages on every export.
    #[derive(Default)]
    pub(crate) struct FakeTool {
        pub messages: Mutex<Vec<Value>>,
        pub fail_export: Mutex<bool>,
        pub fail_download: bool,
        pub windows: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeTool {
        pub(crate) fn with(messages: Vec<Value>) -> Self {
            Self {
                messages: Mutex::new(messages),
                ..Self::default()
            }
        }
    }

    impl CaptureTool for FakeTool {
        fn export(&self, source: &SourceConfig, from: u64, to: u64, output: &Path) -> Result<()> {
            lock_unpoisoned(&self.windows).push((from, to));
            if *lock_unpoisoned(&self.fail_export) {
                std::fs::write(output, "{ partial")?;
                anyhow::bail!("tool exited with 1");
            }
            write_batch(
                output,
                &ExportBatch {
                    id: json!(source.id),
                    messages: lock_unpoisoned(&self.messages).clone(),
                },
            )
        }

        fn download(&self, _source: &SourceConfig, _batch: &Path, _dest: &Path) -> Result<()> {
            if self.fail_download {
                anyhow::bail!("download exited with 1");
            }
            Ok(())
        }

        fn lookup(&self, _query: &str) -> Result<Option<ChatListing>> {
            Ok(None)
        }
    }

    fn fixture() -> (tempfile::TempDir, VaultPaths, VaultConfig, SourceConfig) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = VaultPaths::under(tmp.path().to_path_buf());
        (tmp, paths, VaultConfig::default(), SourceConfig::new("42"))
    }

    fn batch() -> Vec<Value> {
        vec![
            json!({"id": 1, "date": 100, "text": "", "file": "a.jpg", "raw": {"GroupedID": 7}}),
            json!({"id": 2, "date": 101, "text": "album", "file": "b.jpg", "raw": {"GroupedID": 7}}),
            json!({"id": 3, "date": 102, "text": "solo"}),
        ]
    }

    #[test]
    fn repeated_capture_of_same_batch_is_idempotent() {
        let (_tmp, paths, cfg, source) = fixture();
        let tool = FakeTool::with(batch());

        let first = capture_with(&paths, &cfg, &source, &tool, 1_000).expect("first capture");
        assert_eq!(first.records, 3);
        assert_eq!(first.entries, 2);
        assert_eq!(first.inserted, 2);
        assert_eq!(first.downloaded, Some(true));

        let second = capture_with(&paths, &cfg, &source, &tool, 2_000).expect("second capture");
        assert_eq!(second.inserted, 0);

        let store = ArchiveStore::open(&paths, "42").expect("store");
        assert_eq!(store.count().expect("count"), 2);
        assert!(!paths.pending_batch("42").exists());
        assert!(!paths.export_batch("42").exists());
    }

    #[test]
    fn cursor_tracks_start_of_last_successful_cycle() {
        let (_tmp, paths, cfg, source) = fixture();
        let tool = FakeTool::with(batch());
        for now in [500, 900, 1_300] {
            let outcome = capture_with(&paths, &cfg, &source, &tool, now).expect("capture");
            assert_eq!(outcome.cursor, now);
        }
        let windows = lock_unpoisoned(&tool.windows).clone();
        assert_eq!(windows, vec![(0, 500), (500, 900), (900, 1_300)]);
        let store = ArchiveStore::open(&paths, "42").expect("store");
        assert_eq!(store.cursor().expect("cursor").last_export_time, 1_300);
    }

    #[test]
    fn tool_failure_changes_nothing() {
        let (_tmp, paths, cfg, source) = fixture();
        let tool = FakeTool::with(batch());
        capture_with(&paths, &cfg, &source, &tool, 500).expect("capture");

        *lock_unpoisoned(&tool.messages) = vec![json!({"id": 9, "date": 600, "text": "late"})];
        *lock_unpoisoned(&tool.fail_export) = true;
        let err = capture_with(&paths, &cfg, &source, &tool, 900).expect_err("must fail");
        assert!(format!("{err:#}").contains("export failed"));

        let store = ArchiveStore::open(&paths, "42").expect("store");
        assert_eq!(store.cursor().expect("cursor").last_export_time, 500);
        assert_eq!(store.count().expect("count"), 2);
        assert!(!paths.export_batch("42").exists());

        *lock_unpoisoned(&tool.fail_export) = false;
        let retry = capture_with(&paths, &cfg, &source, &tool, 1_000).expect("retry");
        assert_eq!(retry.window_start, 500);
        assert_eq!(retry.inserted, 1);
    }

    #[test]
    fn leftover_pending_batch_is_merged_not_replaced() {
        let (_tmp, paths, cfg, source) = fixture();
        write_batch(
            &paths.pending_batch("42"),
            &ExportBatch {
                id: json!("42"),
                messages: vec![json!({"id": 50, "date": 10, "text": "from crashed cycle"})],
            },
        )
        .expect("seed pending");

        let tool = FakeTool::with(vec![json!({"id": 51, "date": 20, "text": "new"})]);
        let outcome = capture_with(&paths, &cfg, &source, &tool, 100).expect("capture");
        assert_eq!(outcome.inserted, 2);
        let store = ArchiveStore::open(&paths, "42").expect("store");
        assert!(store.get(50).expect("get").is_some());
    }

    #[test]
    fn half_written_pending_batch_does_not_stall_capture() {
        let (_tmp, paths, cfg, source) = fixture();
        let pending = paths.pending_batch("42");
        std::fs::create_dir_all(pending.parent().expect("parent")).expect("mkdir");
        std::fs::write(&pending, r#"{"id":"42","messages":[{"id":1,"da"#).expect("seed");

        let tool = FakeTool::with(batch());
        for now in [100, 200, 300] {
            let outcome = capture_with(&paths, &cfg, &source, &tool, now).expect("capture");
            assert_eq!(outcome.cursor, now);
        }
        let store = ArchiveStore::open(&paths, "42").expect("store");
        assert_eq!(store.count().expect("count"), 2);
        assert!(!pending.exists());
    }

    #[test]
    fn download_failure_does_not_block_ingestion() {
        let (_tmp, paths, cfg, source) = fixture();
        let tool = FakeTool {
            fail_download: true,
            ..FakeTool::with(batch())
        };
        let outcome = capture_with(&paths, &cfg, &source, &tool, 100).expect("capture");
        assert_eq!(outcome.downloaded, Some(false));
        assert_eq!(outcome.inserted, 2);
    }

    #[test]
    fn resync_refreshes_reactions_without_inserting() {
        let (_tmp, paths, cfg, mut source) = fixture();
        source.download_files = false;
        let tool = FakeTool::with(vec![json!({"id": 3, "date": 102, "text": "solo"})]);
        capture_with(&paths, &cfg, &source, &tool, 500).expect("capture");

        *lock_unpoisoned(&tool.messages) = vec![
            json!({"id": 3, "date": 102, "text": "solo", "raw": {"Reactions": {"Results": [
                {"Reaction": {"Emoticon": "👍"}, "Count": 4}
            ]}}}),
            json!({"id": 4, "date": 103, "text": "not archived"}),
        ];
        let outcome = resync_with(&paths, &source, &tool, 900).expect("resync");
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.refreshed, 1);
        assert_eq!(outcome.downloaded, None);

        let store = ArchiveStore::open(&paths, "42").expect("store");
        assert_eq!(store.count().expect("count"), 1);
        assert_eq!(store.cursor().expect("cursor").last_export_time, 500);
        let entry = store.get(3).expect("get").expect("present");
        assert_eq!(entry.reaction_summary.expect("reactions").count_for("👍"), 4);
        assert_eq!(lock_unpoisoned(&tool.windows).last(), Some(&(0, 900)));
    }
}
