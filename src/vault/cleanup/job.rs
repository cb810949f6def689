//! The stale share-link cleanup job and the registry that enforces one job
//! per source and one job overall.

use super::checkpoint::{self, CleanupCheckpoint};
use super::links::{Provider, classify, extract_links, scan_needles};
use super::probe::{StalenessProbe, Verdict};
use crate::error::CleanupConflict;
use crate::vault::audit;
use crate::vault::config::CleanupConfig;
use crate::vault::paths::VaultPaths;
use crate::vault::store::ArchiveStore;
use crate::vault::util::{lock_unpoisoned, now_epoch_secs};
use anyhow::{Context, Result};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SCAN_PAGE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub source_id: String,
    pub job_id: String,
    pub status: JobStatus,
    pub providers: Vec<Provider>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub scanned: u64,
    pub candidate: u64,
    pub deleted: u64,
    pub checked_links: u64,
    pub cached_links: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    /// Entry id the scan resumed after, when a checkpoint was used.
    pub resumed_from: Option<i64>,
    pub min_interval_ms: u64,
    pub stop_requested: bool,
}

impl JobSnapshot {
    pub fn idle(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            job_id: String::new(),
            status: JobStatus::Idle,
            providers: Vec::new(),
            started_at: 0,
            finished_at: None,
            scanned: 0,
            candidate: 0,
            deleted: 0,
            checked_links: 0,
            cached_links: 0,
            errors: 0,
            last_error: None,
            resumed_from: None,
            min_interval_ms: 0,
            stop_requested: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    pub min_interval: Duration,
    pub jitter: Duration,
    pub progress_every: u64,
    pub delete_batch: usize,
    pub checkpoint_every: u64,
}

impl From<&CleanupConfig> for CleanupSettings {
    fn from(cfg: &CleanupConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(cfg.min_probe_interval_ms),
            jitter: Duration::from_millis(cfg.probe_jitter_ms),
            progress_every: cfg.progress_every.max(1),
            delete_batch: cfg.delete_batch.max(1) as usize,
            checkpoint_every: cfg.checkpoint_every.max(1),
        }
    }
}

/// Minimum spacing between probe calls, plus random jitter when waiting.
struct Throttle {
    min_interval: Duration,
    jitter: Duration,
    last_call: Option<Instant>,
}

impl Throttle {
    fn new(min_interval: Duration, jitter: Duration) -> Self {
        Self {
            min_interval,
            jitter,
            last_call: None,
        }
    }

    fn wait(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let jitter_ms = self.jitter.as_millis() as u64;
                let jitter = if jitter_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
                };
                thread::sleep(self.min_interval - elapsed + jitter);
            }
        }
        self.last_call = Some(Instant::now());
    }
}

fn write_snapshot_file(path: &Path, snapshot: &JobSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn read_snapshot_file(path: &Path) -> Option<JobSnapshot> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// State shared between a running job and the registry.
struct SharedJob {
    snapshot: Mutex<JobSnapshot>,
    stop: AtomicBool,
    snapshot_path: PathBuf,
    stop_path: PathBuf,
    checkpoint_path: PathBuf,
}

impl SharedJob {
    fn snapshot(&self) -> JobSnapshot {
        lock_unpoisoned(&self.snapshot).clone()
    }

    fn update(&self, apply: impl FnOnce(&mut JobSnapshot)) {
        let copy = {
            let mut snapshot = lock_unpoisoned(&self.snapshot);
            apply(&mut snapshot);
            snapshot.clone()
        };
        if let Err(err) = write_snapshot_file(&self.snapshot_path, &copy) {
            tracing::warn!(source = %copy.source_id, error = %format!("{err:#}"), "snapshot write failed");
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.stop_path.exists()
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    scanned: u64,
    candidate: u64,
    deleted: u64,
    checked_links: u64,
    errors: u64,
    last_error: Option<String>,
}

enum Decision {
    NotCandidate,
    Keep,
    /// Kept because a link check failed; must be checked again.
    Unchecked,
    Delete,
}

/// One pass over a source archive.
struct ScanRun<'a> {
    store: &'a ArchiveStore,
    probe: &'a dyn StalenessProbe,
    providers: &'a [Provider],
    settings: &'a CleanupSettings,
    shared: &'a SharedJob,
    throttle: Throttle,
    cache: HashMap<String, Verdict>,
    counters: Counters,
    pending: Vec<i64>,
    last_scanned: i64,
    last_committed: i64,
    since_checkpoint: u64,
    /// First entry of this run left unchecked, with the scan count before it.
    unchecked_from: Option<(i64, u64)>,
}

impl<'a> ScanRun<'a> {
    fn new(
        store: &'a ArchiveStore,
        probe: &'a dyn StalenessProbe,
        providers: &'a [Provider],
        settings: &'a CleanupSettings,
        shared: &'a SharedJob,
        resume: Option<&CleanupCheckpoint>,
    ) -> Self {
        let after = resume.map(|cp| cp.after_entry_id).unwrap_or(i64::MIN);
        Self {
            store,
            probe,
            providers,
            settings,
            shared,
            throttle: Throttle::new(settings.min_interval, settings.jitter),
            cache: HashMap::new(),
            counters: Counters {
                scanned: resume.map(|cp| cp.scanned).unwrap_or(0),
                ..Counters::default()
            },
            pending: Vec::new(),
            last_scanned: after,
            last_committed: after,
            since_checkpoint: 0,
            unchecked_from: None,
        }
    }

    fn verdict(&mut self, provider: Provider, link: &str) -> Option<Verdict> {
        if let Some(verdict) = self.cache.get(link) {
            return Some(*verdict);
        }
        self.throttle.wait();
        self.counters.checked_links += 1;
        match self.probe.check(provider, link) {
            Ok(verdict) => {
                self.cache.insert(link.to_string(), verdict);
                Some(verdict)
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(source = %self.store.source_id(), %link, error = %message, "link check failed");
                self.counters.errors += 1;
                self.counters.last_error = Some(message);
                None
            }
        }
    }

    /// Delete only when every link is a share link of a job provider and
    /// each one is confirmed stale. Any other link keeps the entry unprobed.
    fn evaluate(&mut self, text: &str) -> Decision {
        let links = extract_links(text)
            .into_iter()
            .map(|link| (classify(link, self.providers), link))
            .collect::<Vec<_>>();
        if links.iter().all(|(provider, _)| provider.is_none()) {
            return Decision::NotCandidate;
        }
        if links.iter().any(|(provider, _)| provider.is_none()) {
            return Decision::Keep;
        }
        let recognized = links
            .into_iter()
            .filter_map(|(provider, link)| provider.map(|p| (p, link)));
        for (provider, link) in recognized {
            match self.verdict(provider, link) {
                Some(Verdict::Stale) => {}
                Some(_) => return Decision::Keep,
                None => return Decision::Unchecked,
            }
        }
        Decision::Delete
    }

    /// Where the checkpoint may move: the last scanned entry, but never past
    /// an entry whose check failed.
    fn checkpoint_target(&self) -> (i64, u64) {
        match self.unchecked_from {
            Some((entry_id, scanned_before)) => (entry_id.saturating_sub(1), scanned_before),
            None => (self.last_scanned, self.counters.scanned),
        }
    }

    fn publish(&self) {
        let counters = self.counters.clone();
        let cached = self.cache.len() as u64;
        self.shared.update(|s| {
            s.scanned = counters.scanned;
            s.candidate = counters.candidate;
            s.deleted = counters.deleted;
            s.checked_links = counters.checked_links;
            s.cached_links = cached;
            s.errors = counters.errors;
            if counters.last_error.is_some() {
                s.last_error = counters.last_error;
            }
        });
    }

    /// Flush pending deletes, then move the checkpoint forward. Nothing past
    /// a committed batch is ever checkpointed.
    fn commit(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let deleted = self.store.delete_entries(&self.pending)?;
            self.counters.deleted += deleted as u64;
            self.pending.clear();
        }
        let (after_entry_id, scanned) = self.checkpoint_target();
        if after_entry_id > self.last_committed {
            checkpoint::save(
                &self.shared.checkpoint_path,
                &CleanupCheckpoint {
                    providers: self.providers.to_vec(),
                    after_entry_id,
                    scanned,
                    committed_at: now_epoch_secs()?,
                },
            )?;
            self.last_committed = after_entry_id;
        }
        self.since_checkpoint = 0;
        self.publish();
        Ok(())
    }

    /// Returns `true` when the scan reached the end, `false` when stopped.
    fn run(&mut self) -> Result<bool> {
        let needles = scan_needles(self.providers);
        loop {
            let page = self
                .store
                .scan_text_after(self.last_scanned, &needles, SCAN_PAGE)?;
            if page.is_empty() {
                break;
            }
            for (entry_id, text) in page {
                if self.shared.stop_requested() {
                    self.commit()?;
                    return Ok(false);
                }
                self.counters.scanned += 1;
                self.since_checkpoint += 1;
                match self.evaluate(&text) {
                    Decision::NotCandidate => {}
                    Decision::Keep => self.counters.candidate += 1,
                    Decision::Unchecked => {
                        self.counters.candidate += 1;
                        if self.unchecked_from.is_none() {
                            self.unchecked_from = Some((entry_id, self.counters.scanned - 1));
                        }
                    }
                    Decision::Delete => {
                        self.counters.candidate += 1;
                        self.pending.push(entry_id);
                    }
                }
                self.last_scanned = entry_id;

                if self.pending.len() >= self.settings.delete_batch
                    || self.since_checkpoint >= self.settings.checkpoint_every
                {
                    self.commit()?;
                } else if self.counters.scanned % self.settings.progress_every == 0 {
                    self.publish();
                }
            }
        }
        self.commit()?;
        Ok(true)
    }
}

/// Held while a cleanup runs; the file lock extends it to other processes.
struct GlobalLease {
    holder: String,
    file: File,
}

impl Drop for GlobalLease {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

/// `Ok(Err(holder))` when another process owns the lock.
fn try_take_lease(path: &Path, holder: &str) -> Result<std::result::Result<GlobalLease, String>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    if FileExt::try_lock_exclusive(&file).is_err() {
        let mut current = String::new();
        let _ = file.read_to_string(&mut current);
        return Ok(Err(current.trim().to_string()));
    }
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{holder}")?;
    file.flush()?;
    Ok(Ok(GlobalLease {
        holder: holder.to_string(),
        file,
    }))
}

fn lock_is_free(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return true;
    };
    if FileExt::try_lock_shared(&file).is_ok() {
        let _ = FileExt::unlock(&file);
        true
    } else {
        false
    }
}

fn conflict(source_id: &str, holder: String, snapshot: Option<Box<JobSnapshot>>) -> CleanupConflict {
    match snapshot {
        Some(snapshot) if holder == source_id => CleanupConflict::AlreadyRunning(snapshot),
        snapshot => CleanupConflict::GlobalLockHeld { holder, snapshot },
    }
}

struct JobEntry {
    shared: Arc<SharedJob>,
    thread: Option<JoinHandle<()>>,
}

struct JobsInner {
    paths: VaultPaths,
    jobs: Mutex<BTreeMap<String, JobEntry>>,
    lease: Mutex<Option<GlobalLease>>,
}

/// Registry of cleanup jobs for one process.
#[derive(Clone)]
pub struct CleanupJobs {
    inner: Arc<JobsInner>,
}

impl CleanupJobs {
    pub fn new(paths: VaultPaths) -> Self {
        Self {
            inner: Arc::new(JobsInner {
                paths,
                jobs: Mutex::new(BTreeMap::new()),
                lease: Mutex::new(None),
            }),
        }
    }

    /// Start a job in a background thread.
    ///
    /// Fails with [`CleanupConflict`] when a job for `source_id` is already
    /// running, or when any other source holds the global cleanup slot.
    pub fn start(
        &self,
        source_id: &str,
        providers: Vec<Provider>,
        settings: CleanupSettings,
        probe: Arc<dyn StalenessProbe>,
    ) -> Result<JobSnapshot> {
        if providers.is_empty() {
            anyhow::bail!("at least one provider is required");
        }
        let paths = &self.inner.paths;
        let Some(store) = ArchiveStore::open_existing(paths, source_id)? else {
            anyhow::bail!("no archive for source {source_id}");
        };

        let mut jobs = lock_unpoisoned(&self.inner.jobs);
        if let Some(entry) = jobs.get(source_id) {
            let snapshot = entry.shared.snapshot();
            if snapshot.is_running() {
                return Err(CleanupConflict::AlreadyRunning(Box::new(snapshot)).into());
            }
        }

        let mut lease = lock_unpoisoned(&self.inner.lease);
        if let Some(current) = lease.as_ref() {
            let holder = current.holder.clone();
            let snapshot = jobs.get(&holder).map(|e| Box::new(e.shared.snapshot()));
            return Err(conflict(source_id, holder, snapshot).into());
        }
        let acquired = match try_take_lease(&paths.cleanup_lock(), source_id)? {
            Ok(acquired) => acquired,
            Err(holder) => {
                let snapshot = (!holder.is_empty())
                    .then(|| read_snapshot_file(&paths.cleanup_snapshot(&holder)))
                    .flatten()
                    .map(Box::new);
                return Err(conflict(source_id, holder, snapshot).into());
            }
        };
        *lease = Some(acquired);
        drop(lease);

        let checkpoint_path = paths.cleanup_checkpoint(source_id);
        let stop_path = paths.cleanup_stop_request(source_id);
        let _ = fs::remove_file(&stop_path);
        let resume = checkpoint::resumable(&checkpoint_path, &providers);
        let started_at = now_epoch_secs()?;
        let snapshot = JobSnapshot {
            job_id: format!("{source_id}-{started_at}-{:08x}", rand::rng().random::<u32>()),
            status: JobStatus::Running,
            providers: providers.clone(),
            started_at,
            scanned: resume.as_ref().map(|cp| cp.scanned).unwrap_or(0),
            resumed_from: resume.as_ref().map(|cp| cp.after_entry_id),
            min_interval_ms: settings.min_interval.as_millis() as u64,
            ..JobSnapshot::idle(source_id)
        };
        let shared = Arc::new(SharedJob {
            snapshot: Mutex::new(snapshot.clone()),
            stop: AtomicBool::new(false),
            snapshot_path: paths.cleanup_snapshot(source_id),
            stop_path,
            checkpoint_path,
        });
        shared.update(|_| {});

        tracing::info!(
            source = source_id,
            job_id = %snapshot.job_id,
            providers = %providers.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(","),
            resumed_from = ?snapshot.resumed_from,
            "cleanup job starting"
        );
        audit::record(
            paths,
            "cleanup",
            "started",
            &format!("source={source_id} job={}", snapshot.job_id),
        );

        let inner = Arc::clone(&self.inner);
        let thread_shared = Arc::clone(&shared);
        let owned_source = source_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("cleanup-{source_id}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut run = ScanRun::new(
                        &store,
                        probe.as_ref(),
                        &providers,
                        &settings,
                        &thread_shared,
                        resume.as_ref(),
                    );
                    let result = run.run();
                    if result.is_err() {
                        run.publish();
                    }
                    result
                }));
                finish_job(&inner, &owned_source, &thread_shared, outcome);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                lock_unpoisoned(&self.inner.lease).take();
                shared.update(|s| {
                    s.status = JobStatus::Error;
                    s.last_error = Some(format!("failed to spawn cleanup thread: {err}"));
                });
                return Err(err).context("failed to spawn cleanup thread");
            }
        };
        jobs.insert(
            source_id.to_string(),
            JobEntry {
                shared,
                thread: Some(handle),
            },
        );
        Ok(snapshot)
    }

    /// Latest snapshot: the in-process job, else whatever another process
    /// last wrote.
    pub fn status(&self, source_id: &str) -> JobSnapshot {
        if let Some(entry) = lock_unpoisoned(&self.inner.jobs).get(source_id) {
            return entry.shared.snapshot();
        }
        let paths = &self.inner.paths;
        let Some(mut snapshot) = read_snapshot_file(&paths.cleanup_snapshot(source_id)) else {
            return JobSnapshot::idle(source_id);
        };
        if snapshot.is_running() && lock_is_free(&paths.cleanup_lock()) {
            snapshot.status = JobStatus::Error;
            snapshot.last_error = Some("job owner exited before finishing".to_string());
        }
        snapshot
    }

    /// Ask a running job to stop at the next entry boundary. Jobs owned by
    /// another process are signalled through a stop file.
    pub fn request_stop(&self, source_id: &str) -> Result<bool> {
        if let Some(entry) = lock_unpoisoned(&self.inner.jobs).get(source_id) {
            if !entry.shared.snapshot().is_running() {
                return Ok(false);
            }
            entry.shared.stop.store(true, Ordering::SeqCst);
            entry.shared.update(|s| s.stop_requested = true);
            return Ok(true);
        }
        if !self.status(source_id).is_running() {
            return Ok(false);
        }
        let path = self.inner.paths.cleanup_stop_request(source_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, b"stop\n").with_context(|| format!("failed to write {}", path.display()))?;
        Ok(true)
    }

    /// Block until the in-process job for `source_id` ends.
    pub fn wait(&self, source_id: &str) -> JobSnapshot {
        let handle = lock_unpoisoned(&self.inner.jobs)
            .get_mut(source_id)
            .and_then(|entry| entry.thread.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.status(source_id)
    }
}

fn finish_job(
    inner: &JobsInner,
    source_id: &str,
    shared: &SharedJob,
    outcome: std::thread::Result<Result<bool>>,
) {
    {
        let mut lease = lock_unpoisoned(&inner.lease);
        if lease.as_ref().is_some_and(|l| l.holder == source_id) {
            *lease = None;
        }
    }

    let finished_at = now_epoch_secs().ok();
    let (status, error) = match outcome {
        Ok(Ok(completed)) => {
            if completed && let Err(err) = checkpoint::clear(&shared.checkpoint_path) {
                tracing::warn!(source = source_id, error = %format!("{err:#}"), "checkpoint clear failed");
            }
            (JobStatus::Done, None)
        }
        Ok(Err(err)) => (JobStatus::Error, Some(format!("{err:#}"))),
        Err(_) => (JobStatus::Error, Some("cleanup job panicked".to_string())),
    };
    let _ = fs::remove_file(&shared.stop_path);
    shared.update(|s| {
        s.status = status;
        s.finished_at = finished_at;
        if let Some(error) = error.clone() {
            s.errors += 1;
            s.last_error = Some(error);
        }
    });

    let snapshot = shared.snapshot();
    tracing::info!(
        source = source_id,
        job_id = %snapshot.job_id,
        status = ?snapshot.status,
        scanned = snapshot.scanned,
        candidate = snapshot.candidate,
        deleted = snapshot.deleted,
        checked_links = snapshot.checked_links,
        cached_links = snapshot.cached_links,
        errors = snapshot.errors,
        "cleanup job finished"
    );
    audit::record(
        &inner.paths,
        "cleanup",
        if snapshot.status == JobStatus::Done { "done" } else { "error" },
        &format!(
            "source={source_id} job={} scanned={} deleted={}",
            snapshot.job_id, snapshot.scanned, snapshot.deleted
        ),
    );
}
