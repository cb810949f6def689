use crate::error::VaultError;
use crate::vault::paths::VaultPaths;
use anyhow::{Result, anyhow};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub interval_secs: u64,
    pub timezone: String,
    /// Zero disables the timeout.
    pub tool_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1800,
            timezone: "Asia/Shanghai".to_string(),
            tool_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    pub reconcile_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { reconcile_secs: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub min_probe_interval_ms: u64,
    pub probe_jitter_ms: u64,
    pub progress_every: u64,
    pub delete_batch: u64,
    pub checkpoint_every: u64,
    pub probe: String,
    #[serde(default)]
    pub probe_command: String,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            min_probe_interval_ms: 1600,
            probe_jitter_ms: 400,
            progress_every: 25,
            delete_batch: 50,
            checkpoint_every: 200,
            probe: "http".to_string(),
            probe_command: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    pub capture: CaptureConfig,
    pub workers: WorkersConfig,
    pub cleanup: CleanupConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialVaultConfig {
    capture: Option<CaptureConfig>,
    workers: Option<WorkersConfig>,
    cleanup: Option<CleanupConfig>,
    http: Option<HttpConfig>,
}

impl VaultConfig {
    pub fn timezone(&self) -> Result<Tz> {
        self.capture
            .timezone
            .parse::<Tz>()
            .map_err(|err| anyhow!("invalid capture timezone `{}`: {err}", self.capture.timezone))
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn validate(cfg: &VaultConfig) -> Result<()> {
    if cfg.capture.interval_secs == 0 {
        return Err(anyhow!("invalid capture interval: must be >= 1 second"));
    }
    cfg.timezone()?;
    if cfg.workers.reconcile_secs == 0 {
        return Err(anyhow!("invalid workers reconcile interval: must be >= 1 second"));
    }
    if cfg.cleanup.progress_every == 0 {
        return Err(anyhow!("invalid cleanup progress cadence: must be >= 1"));
    }
    if cfg.cleanup.delete_batch == 0 {
        return Err(anyhow!("invalid cleanup delete batch: must be >= 1"));
    }
    if cfg.cleanup.checkpoint_every == 0 {
        return Err(anyhow!("invalid cleanup checkpoint cadence: must be >= 1"));
    }
    match cfg.cleanup.probe.as_str() {
        "http" => {}
        "command" if !cfg.cleanup.probe_command.trim().is_empty() => {}
        "command" => {
            return Err(anyhow!(
                "invalid cleanup probe: `command` requires cleanup.probe_command"
            ));
        }
        _ => return Err(anyhow!("invalid cleanup probe: use `http` or `command`")),
    }
    if cfg.http.max_attempts == 0 {
        return Err(anyhow!("invalid http max attempts: must be >= 1"));
    }
    if cfg.http.initial_backoff_ms > cfg.http.max_backoff_ms {
        return Err(anyhow!(
            "invalid http backoff: require initial_backoff_ms <= max_backoff_ms"
        ));
    }
    Ok(())
}

fn resolve_config_path(paths: &VaultPaths) -> PathBuf {
    if let Ok(custom) = env::var("VAULT_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    paths.vault_home.join("vault.toml")
}

fn merge_file_config(paths: &VaultPaths, base: &mut VaultConfig) -> Result<()> {
    let path = resolve_config_path(paths);
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialVaultConfig = toml::from_str(&raw)
        .map_err(|err| VaultError::InvalidConfig(format!("{}: {err}", path.display())))?;
    if let Some(capture) = parsed.capture {
        base.capture = capture;
    }
    if let Some(workers) = parsed.workers {
        base.workers = workers;
    }
    if let Some(cleanup) = parsed.cleanup {
        base.cleanup = cleanup;
    }
    if let Some(http) = parsed.http {
        base.http = http;
    }
    Ok(())
}

pub fn load_config(paths: &VaultPaths) -> Result<VaultConfig> {
    let mut cfg = VaultConfig::default();
    merge_file_config(paths, &mut cfg)?;

    cfg.capture.interval_secs = env_or_u64("VAULT_CAPTURE_INTERVAL_SECS", cfg.capture.interval_secs);
    cfg.capture.timezone = env_or_string("VAULT_TIMEZONE", &cfg.capture.timezone);
    cfg.capture.tool_timeout_secs =
        env_or_u64("VAULT_TOOL_TIMEOUT_SECS", cfg.capture.tool_timeout_secs);
    cfg.workers.reconcile_secs =
        env_or_u64("VAULT_WORKERS_RECONCILE_SECS", cfg.workers.reconcile_secs);
    cfg.cleanup.min_probe_interval_ms = env_or_u64(
        "VAULT_CLEANUP_MIN_INTERVAL_MS",
        cfg.cleanup.min_probe_interval_ms,
    );
    cfg.cleanup.probe_jitter_ms = env_or_u64("VAULT_CLEANUP_JITTER_MS", cfg.cleanup.probe_jitter_ms);
    cfg.cleanup.progress_every =
        env_or_u64("VAULT_CLEANUP_PROGRESS_EVERY", cfg.cleanup.progress_every);
    cfg.cleanup.delete_batch = env_or_u64("VAULT_CLEANUP_DELETE_BATCH", cfg.cleanup.delete_batch);
    cfg.cleanup.checkpoint_every =
        env_or_u64("VAULT_CLEANUP_CHECKPOINT_EVERY", cfg.cleanup.checkpoint_every);
    cfg.cleanup.probe = env_or_string("VAULT_CLEANUP_PROBE", &cfg.cleanup.probe);
    cfg.cleanup.probe_command =
        env_or_string("VAULT_CLEANUP_PROBE_COMMAND", &cfg.cleanup.probe_command);
    cfg.http.max_attempts = env_or_u32("VAULT_HTTP_MAX_ATTEMPTS", cfg.http.max_attempts);
    cfg.http.initial_backoff_ms =
        env_or_u64("VAULT_HTTP_INITIAL_BACKOFF_MS", cfg.http.initial_backoff_ms);
    cfg.http.max_backoff_ms = env_or_u64("VAULT_HTTP_MAX_BACKOFF_MS", cfg.http.max_backoff_ms);
    cfg.http.timeout_secs = env_or_u64("VAULT_HTTP_TIMEOUT_SECS", cfg.http.timeout_secs);

    validate(&cfg).map_err(|err| VaultError::InvalidConfig(format!("{err:#}")))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::{VaultConfig, validate};

    #[test]
    fn defaults_are_valid() {
        let cfg = VaultConfig::default();
        assert!(validate(&cfg).is_ok());
        assert_eq!(cfg.capture.interval_secs, 1800);
        assert_eq!(cfg.cleanup.progress_every, 25);
    }

    #[test]
    fn command_probe_requires_a_program() {
        let mut cfg = VaultConfig::default();
        cfg.cleanup.probe = "command".to_string();
        assert!(validate(&cfg).is_err());
        cfg.cleanup.probe_command = "/usr/local/bin/probe".to_string();
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let mut cfg = VaultConfig::default();
        cfg.capture.timezone = "Mars/Olympus".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn partial_toml_sections_parse() {
        let raw = "[capture]\ninterval_secs = 60\ntimezone = \"UTC\"\ntool_timeout_secs = 0\n";
        let parsed: super::PartialVaultConfig = toml::from_str(raw).expect("parse");
        let capture = parsed.capture.expect("capture section");
        assert_eq!(capture.interval_secs, 60);
        assert!(parsed.cleanup.is_none());
    }
}
