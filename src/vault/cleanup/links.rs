//! Share-link extraction and provider classification.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ali,
    Baidu,
    Quark,
    Xunlei,
}

impl Provider {
    pub const ALL: [Provider; 4] = [Self::Ali, Self::Baidu, Self::Quark, Self::Xunlei];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ali => "ali",
            Self::Baidu => "baidu",
            Self::Quark => "quark",
            Self::Xunlei => "xunlei",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ali" | "aliyun" | "alipan" => Some(Self::Ali),
            "baidu" => Some(Self::Baidu),
            "quark" => Some(Self::Quark),
            "xunlei" | "thunder" => Some(Self::Xunlei),
            _ => None,
        }
    }

    /// Substrings that identify a share link of this provider.
    pub fn patterns(self) -> &'static [&'static str] {
        match self {
            Self::Ali => &["aliyundrive.com/s/", "alipan.com/s/"],
            Self::Baidu => &["pan.baidu.com/s/", "pan.baidu.com/share/init"],
            Self::Quark => &["pan.quark.cn/s/"],
            Self::Xunlei => &["pan.xunlei.com/s/"],
        }
    }

    pub fn matches(self, link: &str) -> bool {
        let lower = link.to_ascii_lowercase();
        self.patterns().iter().any(|p| lower.contains(p))
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse `a,b` into a sorted, de-duplicated, non-empty provider set.
pub fn parse_providers(raw: &str) -> Result<Vec<Provider>> {
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some(provider) = Provider::parse(part) else {
            anyhow::bail!(
                "unknown provider `{part}` (expected one of: {})",
                Provider::ALL.map(Provider::as_str).join(", ")
            );
        };
        out.push(provider);
    }
    out.sort();
    out.dedup();
    if out.is_empty() {
        anyhow::bail!("at least one provider is required");
    }
    Ok(out)
}

fn link_regex() -> &'static Regex {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    LINK_RE.get_or_init(|| Regex::new(r"https?://\S+").expect("valid link regex"))
}

pub fn extract_links(text: &str) -> Vec<&str> {
    link_regex().find_iter(text).map(|m| m.as_str()).collect()
}

/// First requested provider whose patterns match `link`.
pub fn classify(link: &str, providers: &[Provider]) -> Option<Provider> {
    providers.iter().copied().find(|p| p.matches(link))
}

/// Substrings used to pre-filter rows in the store.
pub fn scan_needles(providers: &[Provider]) -> Vec<&'static str> {
    providers
        .iter()
        .flat_map(|p| p.patterns().iter().copied())
        .collect()
}

/// The path segment after `/s/`, which every provider uses as the share id.
pub fn share_id(link: &str) -> Option<&str> {
    let (_, rest) = link.split_once("/s/")?;
    let end = rest.find(['?', '#', '/']).unwrap_or(rest.len());
    Some(&rest[..end]).filter(|id| !id.is_empty())
}
