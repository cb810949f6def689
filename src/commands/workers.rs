use anyhow::{Context, Result};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::{CommandReport, vault_context};
use crate::vault::audit;
use crate::vault::paths::VaultPaths;
use crate::vault::scheduler::{WorkerScheduler, marker_status};
use crate::vault::sources;

const STOP_TIMEOUT: Duration = Duration::from_secs(8);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const WORKERS_COMMAND_MARKER: &str = "workers run";

fn process_alive(pid: u32) -> Result<bool> {
    let status = Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .context("failed to probe process state with `kill -0`")?;
    if !status.success() {
        return Ok(false);
    }

    let ps_out = Command::new("ps")
        .arg("-p")
        .arg(pid.to_string())
        .arg("-o")
        .arg("stat=")
        .output()
        .context("failed to inspect process state with `ps`")?;
    if !ps_out.status.success() {
        return Ok(false);
    }

    let proc_state = String::from_utf8_lossy(&ps_out.stdout).trim().to_string();
    Ok(!proc_state.starts_with('Z'))
}

fn process_command_line(pid: u32) -> Result<String> {
    let output = Command::new("ps")
        .arg("-p")
        .arg(pid.to_string())
        .arg("-o")
        .arg("command=")
        .output()
        .context("failed to inspect process command line with `ps`")?;
    if !output.status.success() {
        return Ok(String::new());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn send_sigterm(pid: u32) -> Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .context("failed to send SIGTERM with `kill -TERM`")?;
    if status.success() {
        return Ok(());
    }
    if process_alive(pid)? {
        anyhow::bail!("`kill -TERM {pid}` failed and process is still alive");
    }
    Ok(())
}

fn reconcile_once(paths: &VaultPaths, scheduler: &WorkerScheduler) {
    let configured = match sources::load(paths) {
        Ok(configured) => configured,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "failed to reload sources; keeping current workers");
            return;
        }
    };
    match scheduler.reconcile(&configured) {
        Ok((started, stopped)) => {
            if !started.is_empty() || !stopped.is_empty() {
                tracing::info!(
                    started = %started.join(","),
                    stopped = %stopped.join(","),
                    "workers reconciled"
                );
            }
        }
        Err(err) => tracing::warn!(error = %format!("{err:#}"), "worker reconcile failed"),
    }
}

/// Enable workers and keep them matched to `sources.json` until the process
/// is terminated.
pub fn run() -> Result<CommandReport> {
    let mut report = CommandReport::new("workers-run");
    let (paths, cfg) = vault_context()?;
    let configured = sources::load(&paths)?;
    let scheduler = WorkerScheduler::for_vault(&paths, &cfg);

    if !scheduler.start_all(&configured)? {
        let status = marker_status(&paths.workers_marker())?;
        report.issue(format!(
            "workers already enabled (holder pid {})",
            status
                .holder_pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ));
        return Ok(report);
    }
    audit::record(
        &paths,
        "workers",
        "enabled",
        &format!("pid={} sources={}", std::process::id(), configured.len()),
    );
    tracing::info!(
        sources = configured.len(),
        interval_secs = cfg.capture.interval_secs,
        reconcile_secs = cfg.workers.reconcile_secs,
        "workers enabled"
    );

    // Runs until SIGTERM; the OS releases the marker lock with the process.
    let reconcile_every = Duration::from_secs(cfg.workers.reconcile_secs);
    loop {
        thread::sleep(reconcile_every);
        reconcile_once(&paths, &scheduler);
    }
}

pub fn status() -> Result<CommandReport> {
    let mut report = CommandReport::new("workers-status");
    let (paths, _cfg) = vault_context()?;
    let marker = paths.workers_marker();
    let status = marker_status(&marker)?;
    report.detail(format!("marker={}", marker.display()));
    report.detail(format!("workers_enabled={}", status.held));
    if let Some(pid) = status.holder_pid {
        report.detail(format!("holder_pid={pid}"));
    }
    let configured = sources::load(&paths)?;
    report.detail(format!("sources={}", configured.len()));
    report.attach(&serde_json::json!({
        "enabled": status.held,
        "holder_pid": status.holder_pid,
        "sources": configured.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
    }))?;
    Ok(report)
}

pub fn stop() -> Result<CommandReport> {
    let mut report = CommandReport::new("workers-stop");
    let (paths, _cfg) = vault_context()?;
    let marker = paths.workers_marker();
    report.detail(format!("marker={}", marker.display()));

    let status = marker_status(&marker)?;
    if !status.held {
        report.detail("workers already stopped (marker not held)");
        return Ok(report);
    }
    let Some(pid) = status.holder_pid else {
        report.issue(format!(
            "marker {} is held but names no pid",
            marker.display()
        ));
        return Ok(report);
    };
    report.detail(format!("holder_pid={pid}"));

    if !process_alive(pid)? {
        report.detail(format!("holder pid {pid} is not running"));
        return Ok(report);
    }

    let command_line = process_command_line(pid)?;
    if !command_line.contains(WORKERS_COMMAND_MARKER) {
        report.issue(format!(
            "refusing to stop pid {pid}; command does not match a workers process: {}",
            if command_line.is_empty() {
                "<unknown>".to_string()
            } else {
                command_line
            }
        ));
        return Ok(report);
    }

    send_sigterm(pid)?;
    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        if !marker_status(&marker)?.held {
            report.detail(format!("stopped workers pid={pid}"));
            audit::record(&paths, "workers", "disabled", &format!("pid={pid}"));
            return Ok(report);
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }

    report.issue(format!(
        "timed out waiting for workers pid {pid} to stop after {}s",
        STOP_TIMEOUT.as_secs()
    ));
    Ok(report)
}
