//! Batch files written by the capture tool, and their typed decoding.
//!
//! The tool emits loosely shaped JSON. Everything past [`decode_records`]
//! works on [`RawRecord`] only; records that do not decode are dropped here.

use crate::vault::model::{RawRecord, ReactionCount, ReactionSummary};
use crate::vault::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportBatch {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: i64,
    #[serde(default)]
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    raw: Option<WireRaw>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRaw {
    #[serde(rename = "FromID", default)]
    from_id: Option<Value>,
    #[serde(rename = "ReplyTo", default)]
    reply_to: Option<Value>,
    #[serde(rename = "Reactions", default)]
    reactions: Option<Value>,
    #[serde(rename = "GroupedID", default)]
    grouped_id: Option<Value>,
}

pub fn read_batch(path: &Path) -> Result<ExportBatch> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let batch: ExportBatch = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse batch {}", path.display()))?;
    Ok(batch)
}

pub fn write_batch(path: &Path, batch: &ExportBatch) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string(batch)?)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// A pending batch that no longer parses is renamed to
/// `<name>.corrupt-<epoch>` and the cycle starts from an empty one.
fn load_pending(pending: &Path, source_id: &str) -> Result<ExportBatch> {
    let empty = ExportBatch {
        id: Value::String(source_id.to_string()),
        messages: Vec::new(),
    };
    if !pending.exists() {
        return Ok(empty);
    }
    match read_batch(pending) {
        Ok(batch) => Ok(batch),
        Err(err) => {
            let aside = pending.with_extension(format!("json.corrupt-{}", now_epoch_secs()?));
            fs::rename(pending, &aside)
                .with_context(|| format!("failed to move aside {}", pending.display()))?;
            tracing::warn!(
                source = source_id,
                error = %format!("{err:#}"),
                moved_to = %aside.display(),
                "unreadable pending batch set aside"
            );
            Ok(empty)
        }
    }
}

/// Append the fresh export onto whatever an earlier interrupted cycle left in
/// `pending`, persist the union, and return it.
pub fn merge_into_pending(pending: &Path, fresh: &Path, source_id: &str) -> Result<ExportBatch> {
    let mut merged = load_pending(pending, source_id)?;
    let fresh = read_batch(fresh)?;
    merged.messages.extend(fresh.messages);
    write_batch(pending, &merged)?;
    Ok(merged)
}

fn group_id_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) if n.as_i64() != Some(0) => n.to_string(),
        Some(Value::String(s)) if !s.trim().is_empty() && s.trim() != "0" => s.trim().to_string(),
        _ => String::new(),
    }
}

fn nonzero_i64(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64).filter(|v| *v != 0)
}

fn decode_reactions(value: Option<&Value>) -> Option<ReactionSummary> {
    let results = value?.get("Results")?.as_array()?;
    let mut counts = Vec::new();
    for item in results {
        let Some(emoticon) = item
            .get("Reaction")
            .and_then(|r| r.get("Emoticon"))
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        else {
            continue;
        };
        let count = item.get("Count").and_then(Value::as_i64).unwrap_or(0).max(0) as u64;
        counts.push(ReactionCount {
            emoticon: emoticon.to_string(),
            count,
        });
    }
    ReactionSummary { counts }.non_empty()
}

fn decode_one(value: Value) -> Option<RawRecord> {
    let wire: WireMessage = serde_json::from_value(value).ok()?;
    let raw = wire.raw.unwrap_or_default();
    let sender_user_id = raw
        .from_id
        .as_ref()
        .and_then(|from| nonzero_i64(from.get("UserID")));
    let reply_to = raw
        .reply_to
        .as_ref()
        .and_then(|reply| nonzero_i64(reply.get("ReplyToMsgID")));

    Some(RawRecord {
        entry_id: wire.id,
        group_id: group_id_text(raw.grouped_id.as_ref()),
        sender_user_id,
        text: wire.text.unwrap_or_default(),
        file: wire.file.filter(|f| !f.trim().is_empty()),
        date: wire.date,
        reply_to,
        reactions: decode_reactions(raw.reactions.as_ref()),
    })
}

/// Decode in source order, skipping malformed records and repeated ids (first wins).
pub fn decode_records(messages: Vec<Value>) -> Vec<RawRecord> {
    let mut seen = BTreeSet::new();
    messages
        .into_iter()
        .filter_map(decode_one)
        .filter(|record| seen.insert(record.entry_id))
        .collect()
}
