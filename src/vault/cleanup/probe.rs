//! Staleness probes: decide whether a share link still resolves to content.

use super::links::{Provider, share_id};
use super::retry::{RetryPolicy, should_retry_http};
use crate::vault::config::VaultConfig;
use crate::vault::util::{run_command_with_optional_timeout, tail_lines};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Stale,
    Fresh,
    /// The probe answered but could not tell.
    Indeterminate,
}

impl Verdict {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stale" => Self::Stale,
            "fresh" => Self::Fresh,
            _ => Self::Indeterminate,
        }
    }
}

/// Rate limiting and caching are the caller's job; a probe checks one link.
pub trait StalenessProbe: Send + Sync {
    fn check(&self, provider: Provider, link: &str) -> Result<Verdict>;
}

const ALI_SHARE_API: &str =
    "https://api.aliyundrive.com/adrive/v3/share_link/get_share_by_anonymous";
const QUARK_SHARE_API: &str = "https://drive-h.quark.cn/1/clouddrive/share/sharepage/token";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko)";

const BAIDU_STALE_MARKERS: [&str; 5] = [
    "链接不存在",
    "分享的文件已经被取消",
    "此链接分享内容可能因为涉及侵权",
    "啊哦，你来晚了",
    "share/error",
];
const QUARK_STALE_MARKERS: [&str; 5] = ["失效", "不存在", "取消", "违规", "过期"];

/// An anonymous share lookup: missing name, or no files without a
/// password gate, means the share is gone.
pub fn ali_verdict(body: &Value) -> Verdict {
    if body.get("share_name").is_none_or(Value::is_null) {
        return Verdict::Stale;
    }
    let has_pwd = body.get("has_pwd").and_then(Value::as_bool).unwrap_or(false);
    let no_files = body
        .get("file_infos")
        .and_then(Value::as_array)
        .is_none_or(Vec::is_empty);
    if no_files && !has_pwd {
        Verdict::Stale
    } else {
        Verdict::Fresh
    }
}

pub fn baidu_verdict(final_url: &str, status: u16, body: &str) -> Verdict {
    if final_url.contains("/error/") || BAIDU_STALE_MARKERS.iter().any(|m| body.contains(m)) {
        return Verdict::Stale;
    }
    if status == 404 {
        return Verdict::Stale;
    }
    if (200..300).contains(&status) {
        Verdict::Fresh
    } else {
        Verdict::Indeterminate
    }
}

pub fn quark_verdict(body: &Value) -> Verdict {
    if body.get("code").and_then(Value::as_i64) == Some(0) {
        return Verdict::Fresh;
    }
    let message = body.get("message").and_then(Value::as_str).unwrap_or("");
    if QUARK_STALE_MARKERS.iter().any(|m| message.contains(m)) {
        Verdict::Stale
    } else {
        Verdict::Indeterminate
    }
}

/// Built-in probe that talks to each provider's public share endpoints.
pub struct HttpProbe {
    client: Client,
    retry: RetryPolicy,
}

impl HttpProbe {
    pub fn new(cfg: &VaultConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            retry: RetryPolicy::from_config(&cfg.http),
        })
    }

    fn send(
        &self,
        build: impl Fn() -> reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response> {
        self.retry
            .run(|_| build().send(), should_retry_http)
            .map_err(Into::into)
    }

    fn check_ali(&self, link: &str) -> Result<Verdict> {
        let Some(id) = share_id(link) else {
            return Ok(Verdict::Indeterminate);
        };
        let response = self.send(|| {
            self.client
                .post(ALI_SHARE_API)
                .query(&[("share_id", id)])
                .json(&serde_json::json!({ "share_id": id }))
        })?;
        let body: Value = response.json().context("invalid JSON from share lookup")?;
        Ok(ali_verdict(&body))
    }

    fn check_baidu(&self, link: &str) -> Result<Verdict> {
        let response = self.send(|| self.client.get(link))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().unwrap_or_default();
        Ok(baidu_verdict(&final_url, status, &body))
    }

    fn check_quark(&self, link: &str) -> Result<Verdict> {
        let Some(id) = share_id(link) else {
            return Ok(Verdict::Indeterminate);
        };
        let response = self.send(|| {
            self.client
                .post(QUARK_SHARE_API)
                .query(&[("pr", "ucpro"), ("fr", "pc")])
                .json(&serde_json::json!({ "pwd_id": id, "passcode": "" }))
        })?;
        let body: Value = response.json().context("invalid JSON from share token")?;
        Ok(quark_verdict(&body))
    }
}

impl StalenessProbe for HttpProbe {
    fn check(&self, provider: Provider, link: &str) -> Result<Verdict> {
        match provider {
            Provider::Ali => self.check_ali(link),
            Provider::Baidu => self.check_baidu(link),
            Provider::Quark => self.check_quark(link),
            // Needs a signed session; use the command probe for it.
            Provider::Xunlei => Ok(Verdict::Indeterminate),
        }
    }
}

/// Delegates to an external program: `<program> <provider> <link>` printing
/// `stale` or `fresh`.
pub struct CommandProbe {
    program: String,
    timeout_secs: Option<u64>,
}

impl CommandProbe {
    pub fn new(program: impl Into<String>, timeout_secs: Option<u64>) -> Self {
        Self {
            program: program.into(),
            timeout_secs,
        }
    }
}

impl StalenessProbe for CommandProbe {
    fn check(&self, provider: Provider, link: &str) -> Result<Verdict> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(provider.as_str()).arg(link);
        let out = run_command_with_optional_timeout(&mut cmd, self.timeout_secs)
            .with_context(|| format!("failed to run probe `{}`", self.program))?;
        if !out.status.success() {
            anyhow::bail!(
                "probe exited with {}: {}",
                out.status,
                tail_lines(&String::from_utf8_lossy(&out.stderr), 5)
            );
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let answer = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        Ok(Verdict::parse(answer))
    }
}

pub fn build_probe(cfg: &VaultConfig) -> Result<Box<dyn StalenessProbe>> {
    match cfg.cleanup.probe.as_str() {
        "http" => Ok(Box::new(HttpProbe::new(cfg)?)),
        "command" => Ok(Box::new(CommandProbe::new(
            cfg.cleanup.probe_command.clone(),
            Some(cfg.http.timeout_secs).filter(|s| *s > 0),
        ))),
        other => anyhow::bail!("unknown cleanup probe `{other}`"),
    }
}
