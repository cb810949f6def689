pub mod browse;
pub mod capture;
pub mod cleanup;
pub mod resync;
pub mod sources;
pub mod status;
pub mod workers;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::vault::config::{VaultConfig, load_config};
use crate::vault::paths::{VaultPaths, resolve_paths};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
    /// Structured payload for commands that return records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
            data: None,
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn attach(&mut self, data: &impl Serialize) -> Result<()> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(())
    }

}

pub fn vault_context() -> Result<(VaultPaths, VaultConfig)> {
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    Ok((paths, cfg))
}

pub fn ensure_tdl_available(report: &mut CommandReport) -> bool {
    match crate::tdl::resolve_tdl_bin() {
        Ok(bin) => {
            report.detail(format!("tdl_bin={}", bin.display()));
            true
        }
        Err(err) => {
            let code = crate::error::error_code(&err)
                .map(|code| code.as_str())
                .unwrap_or("error");
            report.issue(format!("{code}: {err:#}"));
            false
        }
    }
}
