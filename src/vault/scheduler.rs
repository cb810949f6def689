//! Per-source capture loops gated by a process-group-wide workers marker.

use crate::vault::audit;
use crate::vault::capture;
use crate::vault::config::VaultConfig;
use crate::vault::paths::VaultPaths;
use crate::vault::sources::SourceConfig;
use crate::vault::util::lock_unpoisoned;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cooperative cancellation signal shared between a loop and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *lock_unpoisoned(flag) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock_unpoisoned(&self.inner.0)
    }

    /// Block for up to `timeout`. Returns `true` if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock_unpoisoned(flag);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Exclusive hold on the workers-enabled marker file.
///
/// The OS drops the lock when the holding process dies, so a crashed holder
/// never blocks the next one.
#[derive(Debug)]
pub struct WorkersMarker {
    file: File,
}

fn open_marker(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

impl WorkersMarker {
    /// `Ok(None)` when another holder already has it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let mut file = open_marker(path)?;
        if FileExt::try_lock_exclusive(&file).is_err() {
            return Ok(None);
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Some(Self { file }))
    }
}

impl Drop for WorkersMarker {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerStatus {
    pub held: bool,
    pub holder_pid: Option<u32>,
}

/// Inspect the marker without taking it.
pub fn marker_status(path: &Path) -> Result<MarkerStatus> {
    if !path.exists() {
        return Ok(MarkerStatus {
            held: false,
            holder_pid: None,
        });
    }
    let mut file = open_marker(path)?;
    if FileExt::try_lock_shared(&file).is_ok() {
        let _ = FileExt::unlock(&file);
        return Ok(MarkerStatus {
            held: false,
            holder_pid: None,
        });
    }
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    Ok(MarkerStatus {
        held: true,
        holder_pid: raw.trim().parse::<u32>().ok(),
    })
}

/// One unit of work a worker loop repeats.
pub trait CycleRunner: Send + Sync {
    fn run_cycle(&self, source: &SourceConfig) -> Result<()>;
}

/// Runs a real capture cycle against the vault.
pub struct CaptureRunner {
    paths: VaultPaths,
    cfg: VaultConfig,
}

impl CaptureRunner {
    pub fn new(paths: VaultPaths, cfg: VaultConfig) -> Self {
        Self { paths, cfg }
    }
}

impl CycleRunner for CaptureRunner {
    fn run_cycle(&self, source: &SourceConfig) -> Result<()> {
        capture::capture(&self.paths, &self.cfg, source).map(|_| ())
    }
}

struct WorkerHandle {
    token: CancelToken,
    thread: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_live(&self) -> bool {
        !self.token.is_cancelled() && !self.thread.is_finished()
    }
}

fn worker_loop(
    runner: Arc<dyn CycleRunner>,
    source: SourceConfig,
    interval: Duration,
    token: CancelToken,
    paths: Option<VaultPaths>,
) {
    tracing::info!(source = %source.label(), interval_secs = interval.as_secs(), "worker started");
    while !token.is_cancelled() {
        let result = catch_unwind(AssertUnwindSafe(|| runner.run_cycle(&source)));
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(_) => Some("capture cycle panicked".to_string()),
        };
        if let Some(message) = failure {
            tracing::warn!(source = %source.label(), error = %message, "capture cycle failed");
            if let Some(paths) = paths.as_ref() {
                audit::record(
                    paths,
                    "capture",
                    "failed",
                    &format!("source={} {message}", source.id),
                );
            }
        }
        if token.wait_timeout(interval) {
            break;
        }
    }
    tracing::info!(source = %source.label(), "worker stopped");
}

pub struct WorkerScheduler {
    runner: Arc<dyn CycleRunner>,
    interval: Duration,
    marker_path: PathBuf,
    audit_paths: Option<VaultPaths>,
    marker: Mutex<Option<WorkersMarker>>,
    workers: Mutex<BTreeMap<String, WorkerHandle>>,
}

impl WorkerScheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, interval: Duration, marker_path: PathBuf) -> Self {
        Self {
            runner,
            interval,
            marker_path,
            audit_paths: None,
            marker: Mutex::new(None),
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Scheduler wired to the vault's marker, interval and audit log.
    pub fn for_vault(paths: &VaultPaths, cfg: &VaultConfig) -> Self {
        let runner = Arc::new(CaptureRunner::new(paths.clone(), cfg.clone()));
        let mut scheduler = Self::new(
            runner,
            Duration::from_secs(cfg.capture.interval_secs),
            paths.workers_marker(),
        );
        scheduler.audit_paths = Some(paths.clone());
        scheduler
    }

    pub fn is_enabled(&self) -> bool {
        lock_unpoisoned(&self.marker).is_some()
    }

    /// Take the workers marker and start a loop per source.
    ///
    /// Returns `false`, doing nothing, when workers are already enabled by
    /// this scheduler or by anyone else holding the marker.
    pub fn start_all(&self, sources: &[SourceConfig]) -> Result<bool> {
        {
            let mut marker = lock_unpoisoned(&self.marker);
            if marker.is_some() {
                return Ok(false);
            }
            let Some(acquired) = WorkersMarker::try_acquire(&self.marker_path)? else {
                tracing::info!(marker = %self.marker_path.display(), "workers already enabled elsewhere");
                return Ok(false);
            };
            *marker = Some(acquired);
        }
        if let Some(paths) = self.audit_paths.as_ref() {
            audit::record(
                paths,
                "workers",
                "enabled",
                &format!("pid={} sources={}", std::process::id(), sources.len()),
            );
        }
        for source in sources {
            self.start_source(source)?;
        }
        Ok(true)
    }

    /// Start a loop for `source`. No-op (returns `false`) when workers are
    /// not enabled or a live loop already exists.
    pub fn start_source(&self, source: &SourceConfig) -> Result<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }
        let mut workers = lock_unpoisoned(&self.workers);
        if workers.get(&source.id).is_some_and(WorkerHandle::is_live) {
            return Ok(false);
        }
        if let Some(stale) = workers.remove(&source.id) {
            stale.token.cancel();
            let _ = stale.thread.join();
        }

        let token = CancelToken::new();
        let runner = Arc::clone(&self.runner);
        let interval = self.interval;
        let loop_source = source.clone();
        let loop_token = token.clone();
        let paths = self.audit_paths.clone();
        let thread = thread::Builder::new()
            .name(format!("capture-{}", source.id))
            .spawn(move || worker_loop(runner, loop_source, interval, loop_token, paths))
            .with_context(|| format!("failed to spawn worker for source {}", source.id))?;
        workers.insert(source.id.clone(), WorkerHandle { token, thread });
        Ok(true)
    }

    /// Cancel the loop for `source_id` and wait for an in-flight cycle to
    /// return. Returns `false` if there was no loop.
    pub fn stop_source(&self, source_id: &str) -> bool {
        let handle = lock_unpoisoned(&self.workers).remove(source_id);
        let Some(handle) = handle else {
            return false;
        };
        handle.token.cancel();
        let _ = handle.thread.join();
        true
    }

    #[cfg(test)]
    pub fn running_sources(&self) -> Vec<String> {
        lock_unpoisoned(&self.workers)
            .iter()
            .filter(|(_, handle)| handle.is_live())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Align running loops with `sources`: start missing ones, stop removed
    /// ones. Returns `(started, stopped)` source ids.
    pub fn reconcile(&self, sources: &[SourceConfig]) -> Result<(Vec<String>, Vec<String>)> {
        let mut started = Vec::new();
        for source in sources {
            if self.start_source(source)? {
                started.push(source.id.clone());
            }
        }
        let wanted = sources.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
        let orphaned = lock_unpoisoned(&self.workers)
            .keys()
            .filter(|id| !wanted.contains(&id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        let mut stopped = Vec::new();
        for id in orphaned {
            if self.stop_source(&id) {
                stopped.push(id);
            }
        }
        Ok((started, stopped))
    }

    /// Cancel every loop, wait for them, and release the marker.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *lock_unpoisoned(&self.workers));
        for handle in handles.values() {
            handle.token.cancel();
        }
        for (_, handle) in handles {
            let _ = handle.thread.join();
        }
        let released = lock_unpoisoned(&self.marker).take();
        if released.is_some()
            && let Some(paths) = self.audit_paths.as_ref()
        {
            audit::record(paths, "workers", "disabled", &format!("pid={}", std::process::id()));
        }
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelToken, CycleRunner, WorkerScheduler, WorkersMarker, marker_status};
    use crate::vault::sources::SourceConfig;
    use anyhow::Result;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct CountingRunner {
        cycles: AtomicUsize,
        fail: bool,
    }

    impl CycleRunner for CountingRunner {
        fn run_cycle(&self, _source: &SourceConfig) -> Result<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("tool exited with 1");
            }
            Ok(())
        }
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    #[test]
    fn cancel_wakes_waiters_immediately() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));

        let waiter = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().expect("join"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn only_one_scheduler_enables_workers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let marker = tmp.path().join("state/workers.lock");
        let runner = Arc::new(CountingRunner::default());
        let a = WorkerScheduler::new(runner.clone(), Duration::from_secs(60), marker.clone());
        let b = WorkerScheduler::new(runner, Duration::from_secs(60), marker.clone());

        let results = [
            a.start_all(&[]).expect("start a"),
            b.start_all(&[]).expect("start b"),
        ];
        assert_eq!(results.iter().filter(|r| **r).count(), 1);
        assert!(!a.start_all(&[]).expect("restart a"));

        let status = marker_status(&marker).expect("status");
        assert!(status.held);
        assert_eq!(status.holder_pid, Some(std::process::id()));

        a.shutdown();
        assert!(!marker_status(&marker).expect("status").held);
        assert!(b.start_all(&[]).expect("start b again"));
    }

    #[test]
    fn marker_is_free_once_holder_drops() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("workers.lock");
        let held = WorkersMarker::try_acquire(&path).expect("acquire");
        assert!(held.is_some());
        assert!(WorkersMarker::try_acquire(&path).expect("second").is_none());
        drop(held);
        assert!(WorkersMarker::try_acquire(&path).expect("third").is_some());
    }

    #[test]
    fn cancelled_loop_runs_no_extra_cycle() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(CountingRunner::default());
        let scheduler = WorkerScheduler::new(
            runner.clone(),
            Duration::from_secs(3600),
            tmp.path().join("workers.lock"),
        );
        let source = SourceConfig::new("7");
        assert!(scheduler.start_all(std::slice::from_ref(&source)).expect("start"));
        assert!(wait_for(|| runner.cycles.load(Ordering::SeqCst) == 1));

        assert!(!scheduler.start_source(&source).expect("idempotent start"));
        assert_eq!(scheduler.running_sources(), vec!["7".to_string()]);

        let started = Instant::now();
        assert!(scheduler.stop_source("7"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(runner.cycles.load(Ordering::SeqCst), 1);
        assert!(scheduler.running_sources().is_empty());
        assert!(!scheduler.stop_source("7"));
    }

    #[test]
    fn failing_cycles_keep_the_loop_alive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(CountingRunner {
            fail: true,
            ..CountingRunner::default()
        });
        let scheduler = WorkerScheduler::new(
            runner.clone(),
            Duration::from_millis(5),
            tmp.path().join("workers.lock"),
        );
        scheduler
            .start_all(&[SourceConfig::new("1")])
            .expect("start");
        assert!(wait_for(|| runner.cycles.load(Ordering::SeqCst) >= 3));
        assert_eq!(scheduler.running_sources(), vec!["1".to_string()]);
        scheduler.shutdown();
    }

    #[test]
    fn reconcile_starts_new_and_stops_removed_sources() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(CountingRunner::default());
        let scheduler = WorkerScheduler::new(
            runner,
            Duration::from_secs(3600),
            tmp.path().join("workers.lock"),
        );
        let a = SourceConfig::new("a");
        let b = SourceConfig::new("b");

        assert!(
            !scheduler
                .start_source(&a)
                .expect("start before enable")
        );
        scheduler.start_all(std::slice::from_ref(&a)).expect("start");

        let (started, stopped) = scheduler.reconcile(&[b.clone()]).expect("reconcile");
        assert_eq!(started, vec!["b".to_string()]);
        assert_eq!(stopped, vec!["a".to_string()]);
        assert_eq!(scheduler.running_sources(), vec!["b".to_string()]);
    }
}
