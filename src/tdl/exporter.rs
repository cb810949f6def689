use super::{CaptureTool, ChatListing};
use crate::error::VaultError;
use crate::vault::sources::SourceConfig;
use crate::vault::util::{lock_unpoisoned, run_command_with_optional_timeout, tail_lines};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Mutex;

const IMAGE_EXTENSIONS: &str = "jpg,jpeg,png,webp,gif";
const LOG_TAIL_LINES: usize = 80;

/// The tool keeps one session database; concurrent runs corrupt it.
static TOOL_LOCK: Mutex<()> = Mutex::new(());

fn ensure_executable_path(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .with_context(|| format!("tdl binary path does not exist: {}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("tdl binary path is not a file: {}", path.display());
    }
    Ok(())
}

/// `TDL_BIN` when set, else `tdl` from `PATH`.
pub fn resolve_tdl_bin() -> Result<PathBuf> {
    if let Ok(custom) = env::var("TDL_BIN") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            ensure_executable_path(&path)
                .map_err(|err| VaultError::ToolUnavailable(format!("{err:#}")))?;
            return Ok(path);
        }
    }
    which::which("tdl").map_err(|_| {
        VaultError::ToolUnavailable("tdl not found on PATH; set TDL_BIN".to_string()).into()
    })
}

pub fn export_args(source: &SourceConfig, from: u64, to: u64, output: &Path) -> Vec<String> {
    let mut args = vec![
        "chat".to_string(),
        "export".to_string(),
        "-c".to_string(),
        source.id.clone(),
        "--with-content".to_string(),
        "-o".to_string(),
        output.display().to_string(),
        "-i".to_string(),
        format!("{from},{to}"),
    ];
    if source.raw_messages {
        args.push("--raw".to_string());
    }
    if source.all_messages {
        args.push("--all".to_string());
    }
    args
}

pub fn download_args(source: &SourceConfig, batch: &Path, dest: &Path) -> Vec<String> {
    let mut args = vec![
        "dl".to_string(),
        "-f".to_string(),
        batch.display().to_string(),
        "-d".to_string(),
        dest.display().to_string(),
        "--skip-same".to_string(),
        "--continue".to_string(),
        "-t".to_string(),
        "8".to_string(),
        "-l".to_string(),
        "4".to_string(),
    ];
    if source.download_images_only {
        args.push("-i".to_string());
        args.push(IMAGE_EXTENSIONS.to_string());
    }
    args
}

#[derive(Debug, Deserialize)]
struct WireChat {
    id: serde_json::Value,
    #[serde(default)]
    visible_name: String,
}

#[derive(Debug, Clone)]
pub struct TdlCli {
    bin: PathBuf,
    timeout_secs: Option<u64>,
}

impl TdlCli {
    pub fn new(bin: PathBuf, timeout_secs: Option<u64>) -> Self {
        Self { bin, timeout_secs }
    }

    pub fn from_env(timeout_secs: Option<u64>) -> Result<Self> {
        Ok(Self::new(resolve_tdl_bin()?, timeout_secs))
    }

    fn run(&self, label: &str, source: &str, args: &[String]) -> Result<Output> {
        tracing::info!(source, command = %args.join(" "), "{label}: running");
        let out = {
            let _guard = lock_unpoisoned(&TOOL_LOCK);
            let mut cmd = Command::new(&self.bin);
            cmd.args(args);
            run_command_with_optional_timeout(&mut cmd, self.timeout_secs)
                .with_context(|| format!("failed to run `{} {}`", self.bin.display(), args.join(" ")))?
        };

        let stdout_tail = tail_lines(&String::from_utf8_lossy(&out.stdout), LOG_TAIL_LINES);
        let stderr_tail = tail_lines(&String::from_utf8_lossy(&out.stderr), LOG_TAIL_LINES);
        let code = out.status.code().unwrap_or(-1);
        tracing::info!(source, code, "{label}: finished");
        if !stdout_tail.is_empty() {
            tracing::debug!(source, "{label}: stdout (tail):\n{stdout_tail}");
        }
        if !stderr_tail.is_empty() {
            if out.status.success() {
                tracing::debug!(source, "{label}: stderr (tail):\n{stderr_tail}");
            } else {
                tracing::warn!(source, "{label}: stderr (tail):\n{stderr_tail}");
            }
        }
        Ok(out)
    }

    fn run_checked(&self, label: &str, source: &str, args: &[String]) -> Result<Output> {
        let out = self.run(label, source, args)?;
        if !out.status.success() {
            anyhow::bail!(
                "{label} exited with {}: {}",
                out.status,
                tail_lines(&String::from_utf8_lossy(&out.stderr), 5)
            );
        }
        Ok(out)
    }
}

impl CaptureTool for TdlCli {
    fn export(&self, source: &SourceConfig, from: u64, to: u64, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        self.run_checked(
            "tdl chat export",
            &source.id,
            &export_args(source, from, to, output),
        )?;
        if !output.exists() {
            anyhow::bail!("tdl chat export wrote no file at {}", output.display());
        }
        Ok(())
    }

    fn download(&self, source: &SourceConfig, batch: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
        self.run_checked("tdl dl", &source.id, &download_args(source, batch, dest))?;
        Ok(())
    }

    fn lookup(&self, query: &str) -> Result<Option<ChatListing>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }
        let filter = if query.chars().all(|c| c.is_ascii_digit()) {
            format!("ID == '{query}'")
        } else {
            format!("Username == '{query}'")
        };
        let args = ["chat", "ls", "-o", "json", "-f", filter.as_str()].map(str::to_string);
        let out = self.run_checked("tdl chat ls", query, &args)?;
        let chats: Vec<WireChat> =
            serde_json::from_slice(&out.stdout).context("invalid JSON from tdl chat ls")?;
        Ok(chats.into_iter().next().map(|chat| ChatListing {
            id: match chat.id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            },
            visible_name: chat.visible_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{download_args, export_args};
    use crate::vault::sources::SourceConfig;
    use std::path::Path;

    #[test]
    fn export_args_follow_source_flags() {
        let mut source = SourceConfig::new("123");
        let args = export_args(&source, 10, 20, Path::new("/tmp/out.json"));
        assert_eq!(
            args,
            vec![
                "chat", "export", "-c", "123", "--with-content", "-o", "/tmp/out.json", "-i",
                "10,20", "--raw", "--all"
            ]
        );

        source.raw_messages = false;
        source.all_messages = false;
        let args = export_args(&source, 0, 5, Path::new("out.json"));
        assert!(!args.iter().any(|a| a == "--raw" || a == "--all"));
    }

    #[test]
    fn images_only_download_filters_extensions() {
        let mut source = SourceConfig::new("9");
        let args = download_args(&source, Path::new("b.json"), Path::new("dl"));
        assert!(!args.iter().any(|a| a == "-i"));
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "8"));

        source.download_images_only = true;
        let args = download_args(&source, Path::new("b.json"), Path::new("dl"));
        assert_eq!(&args[args.len() - 2..], ["-i", "jpg,jpeg,png,webp,gif"]);
    }
}
