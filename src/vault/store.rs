//! [`ArchiveStore`]: one SQLite file per source.
//!
//! Every operation opens its own connection and drops it before returning,
//! so no caller can hold a write transaction across a subprocess or network
//! call.

use crate::vault::model::{AuthorTag, DisplayGeometry, Entry, LinkPreview, ReactionSummary};
use crate::vault::paths::VaultPaths;
use crate::vault::schema::{SCHEMA, SCHEMA_VERSION};
use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const LAST_EXPORT_TIME: &str = "last_export_time";
const EXPORTED_TIME: &str = "exported_time";

pub(crate) const ENTRY_COLUMNS: &str = "source_id, entry_id, captured_at, captured_ts, \
     attachment_path, attachment_list, author_tag, body_text, reply_target_id, \
     reactions, link_preview, display_width, display_height";

/// Persisted capture window state for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureCursor {
    /// Exclusive lower bound of the next capture window.
    pub last_export_time: u64,
    /// Advisory: when the last tool output was merged.
    pub exported_time: u64,
}

#[derive(Debug, Clone)]
pub struct ArchiveStore {
    path: PathBuf,
    source_id: String,
}

fn encode_json<T: Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let attachment_list: Option<String> = row.get(5)?;
    let author_tag: String = row.get(6)?;
    let width: Option<i64> = row.get(11)?;
    let height: Option<i64> = row.get(12)?;
    let display_geometry = match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(DisplayGeometry {
            width: w as u32,
            height: h as u32,
        }),
        _ => None,
    };
    Ok(Entry {
        source_id: row.get(0)?,
        entry_id: row.get(1)?,
        captured_at: row.get(2)?,
        captured_ts: row.get(3)?,
        attachment_path: row.get::<_, Option<String>>(4)?.filter(|p| !p.is_empty()),
        attachment_list: decode_json::<Vec<String>>(attachment_list).unwrap_or_default(),
        author_tag: AuthorTag::parse(&author_tag),
        body_text: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        reply_target_id: row.get::<_, Option<i64>>(8)?.filter(|id| *id != 0),
        reaction_summary: decode_json(row.get(9)?),
        link_preview: decode_json(row.get(10)?),
        display_geometry,
    })
}

fn read_meta_u64(conn: &Connection, key: &str) -> Result<u64> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(raw
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0))
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

impl ArchiveStore {
    /// Open (or create) the archive for `source_id` under the vault data dir.
    pub fn open(paths: &VaultPaths, source_id: &str) -> Result<Self> {
        Self::at(paths.archive_db(source_id), source_id)
    }

    /// Open an existing archive without creating one.
    pub fn open_existing(paths: &VaultPaths, source_id: &str) -> Result<Option<Self>> {
        let path = paths.archive_db(source_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::at(path, source_id).map(Some)
    }

    pub fn at(path: impl Into<PathBuf>, source_id: &str) -> Result<Self> {
        let store = Self {
            path: path.into(),
            source_id: source_id.to_string(),
        };
        if let Some(parent) = store.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = store.connect()?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version > SCHEMA_VERSION {
            anyhow::bail!(
                "archive {} has schema version {version}, newest supported is {SCHEMA_VERSION}",
                store.path.display()
            );
        }
        conn.execute_batch(SCHEMA)
            .with_context(|| format!("failed to initialise {}", store.path.display()))?;
        Ok(store)
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub(crate) fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // SQLite's LOWER only folds ASCII.
        conn.create_scalar_function(
            "fold_case",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
        )?;
        Ok(conn)
    }

    /// Insert entries that are not yet archived. Existing ids are left
    /// untouched; returns how many rows were actually inserted.
    pub fn insert_entries(&self, entries: &[Entry]) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO messages ({ENTRY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ))?;
            for entry in entries {
                let attachment_list = if entry.attachment_list.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&entry.attachment_list)?)
                };
                inserted += stmt.execute(params![
                    self.source_id,
                    entry.entry_id,
                    entry.captured_at,
                    entry.captured_ts,
                    entry.attachment_path,
                    attachment_list,
                    entry.author_tag.as_str(),
                    entry.body_text,
                    entry.reply_target_id,
                    encode_json(entry.reaction_summary.as_ref())?,
                    encode_json(entry.link_preview.as_ref())?,
                    entry.display_geometry.map(|g| g.width),
                    entry.display_geometry.map(|g| g.height),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn cursor(&self) -> Result<CaptureCursor> {
        let conn = self.connect()?;
        Ok(CaptureCursor {
            last_export_time: read_meta_u64(&conn, LAST_EXPORT_TIME)?,
            exported_time: read_meta_u64(&conn, EXPORTED_TIME)?,
        })
    }

    pub fn mark_exported(&self, at: u64) -> Result<()> {
        let conn = self.connect()?;
        write_meta(&conn, EXPORTED_TIME, &at.to_string())
    }

    /// Move `last_export_time` forward to `to`; never backwards.
    pub fn advance_cursor(&self, to: u64) -> Result<u64> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let current = read_meta_u64(&tx, LAST_EXPORT_TIME)?;
        let next = current.max(to);
        write_meta(&tx, LAST_EXPORT_TIME, &next.to_string())?;
        tx.commit()?;
        Ok(next)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.connect()?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE source_id = ?1",
            params![self.source_id],
            |r| r.get(0),
        )?;
        Ok(total.max(0) as u64)
    }

    pub fn get(&self, entry_id: i64) -> Result<Option<Entry>> {
        let conn = self.connect()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM messages WHERE source_id = ?1 AND entry_id = ?2"
                ),
                params![self.source_id, entry_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Backfill the link preview of one entry.
    pub fn set_link_preview(&self, entry_id: i64, preview: &LinkPreview) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE messages SET link_preview = ?1 WHERE source_id = ?2 AND entry_id = ?3",
            params![serde_json::to_string(preview)?, self.source_id, entry_id],
        )?;
        Ok(changed > 0)
    }

    /// Overwrite reaction summaries of entries that already exist; `None`
    /// clears the column. Returns the number of rows touched.
    pub fn refresh_reactions(&self, updates: &[(i64, Option<ReactionSummary>)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut changed = 0usize;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET reactions = ?1 WHERE source_id = ?2 AND entry_id = ?3",
            )?;
            for (entry_id, summary) in updates {
                let summary = summary.clone().and_then(ReactionSummary::non_empty);
                changed += stmt.execute(params![
                    encode_json(summary.as_ref())?,
                    self.source_id,
                    entry_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Delete entries in a single short transaction. Missing ids are not an
    /// error, so replaying a batch is harmless.
    pub fn delete_entries(&self, entry_ids: &[i64]) -> Result<usize> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        {
            let mut stmt =
                tx.prepare("DELETE FROM messages WHERE source_id = ?1 AND entry_id = ?2")?;
            for entry_id in entry_ids {
                deleted += stmt.execute(params![self.source_id, entry_id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Next page of `(entry_id, body_text)` after `after_id`, in ascending id
    /// order, restricted to texts containing one of `needles`.
    pub fn scan_text_after(
        &self,
        after_id: i64,
        needles: &[&str],
        limit: usize,
    ) -> Result<Vec<(i64, String)>> {
        if needles.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let like_clause = (0..needles.len())
            .map(|i| format!("body_text LIKE ?{}", i + 4))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT entry_id, body_text FROM messages
             WHERE source_id = ?1 AND entry_id > ?2 AND ({like_clause})
             ORDER BY entry_id LIMIT ?3"
        );
        let mut values = vec![
            SqlValue::Text(self.source_id.clone()),
            SqlValue::Integer(after_id),
            SqlValue::Integer(limit as i64),
        ];
        values.extend(
            needles
                .iter()
                .map(|needle| SqlValue::Text(format!("%{needle}%"))),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, Option<String>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(id, text)| (id, text.unwrap_or_default()))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::ArchiveStore;
    use crate::vault::model::{AuthorTag, Entry, LinkPreview, ReactionCount, ReactionSummary};
    use tempfile::TempDir;

    pub(crate) fn entry(id: i64, ts: i64, text: &str) -> Entry {
        Entry {
            source_id: "src".to_string(),
            entry_id: id,
            captured_at: format!("2024-01-01 00:00:{:02}", ts % 60),
            captured_ts: ts,
            attachment_path: None,
            attachment_list: Vec::new(),
            author_tag: AuthorTag::Other,
            body_text: text.to_string(),
            reply_target_id: None,
            reaction_summary: None,
            link_preview: None,
            display_geometry: None,
        }
    }

    pub(crate) fn store() -> (TempDir, ArchiveStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::at(tmp.path().join("messages.db"), "src").expect("open store");
        (tmp, store)
    }

    #[test]
    fn duplicate_ids_are_skipped_not_overwritten() {
        let (_tmp, store) = store();
        assert_eq!(store.insert_entries(&[entry(1, 10, "original")]).expect("insert"), 1);

        let mut again = entry(1, 99, "changed");
        again.attachment_list = vec!["x.jpg".to_string()];
        assert_eq!(store.insert_entries(&[again, entry(2, 11, "new")]).expect("insert"), 1);

        let kept = store.get(1).expect("get").expect("present");
        assert_eq!(kept.body_text, "original");
        assert_eq!(kept.captured_ts, 10);
        assert!(kept.attachment_list.is_empty());
        assert_eq!(store.count().expect("count"), 2);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let (_tmp, store) = store();
        assert_eq!(store.cursor().expect("cursor").last_export_time, 0);
        assert_eq!(store.advance_cursor(100).expect("advance"), 100);
        assert_eq!(store.advance_cursor(50).expect("advance"), 100);
        store.mark_exported(120).expect("mark");
        let cursor = store.cursor().expect("cursor");
        assert_eq!(cursor.last_export_time, 100);
        assert_eq!(cursor.exported_time, 120);
    }

    #[test]
    fn entries_round_trip_structured_columns() {
        let (_tmp, store) = store();
        let mut e = entry(5, 10, "with extras");
        e.attachment_list = vec!["a.jpg".to_string(), "b.jpg".to_string()];
        e.author_tag = AuthorTag::Own;
        e.reply_target_id = Some(4);
        e.reaction_summary = Some(ReactionSummary {
            counts: vec![ReactionCount {
                emoticon: "❤".to_string(),
                count: 2,
            }],
        });
        store.insert_entries(std::slice::from_ref(&e)).expect("insert");
        let got = store.get(5).expect("get").expect("present");
        assert_eq!(got, Entry { source_id: "src".to_string(), ..e });
    }

    #[test]
    fn link_preview_and_reactions_are_the_only_updates() {
        let (_tmp, store) = store();
        store.insert_entries(&[entry(1, 10, "see https://example.com")]).expect("insert");

        let preview = LinkPreview {
            title: Some("Example".to_string()),
            ..LinkPreview::default()
        };
        assert!(store.set_link_preview(1, &preview).expect("preview"));
        assert!(!store.set_link_preview(404, &preview).expect("missing"));

        let summary = ReactionSummary {
            counts: vec![ReactionCount {
                emoticon: "👍".to_string(),
                count: 7,
            }],
        };
        assert_eq!(
            store
                .refresh_reactions(&[(1, Some(summary.clone())), (404, None)])
                .expect("refresh"),
            1
        );
        let got = store.get(1).expect("get").expect("present");
        assert_eq!(got.link_preview, Some(preview));
        assert_eq!(got.reaction_summary, Some(summary));

        store.refresh_reactions(&[(1, None)]).expect("clear");
        assert_eq!(store.get(1).expect("get").expect("present").reaction_summary, None);
    }

    #[test]
    fn scan_and_delete_by_id_order() {
        let (_tmp, store) = store();
        store
            .insert_entries(&[
                entry(3, 1, "https://pan.baidu.com/s/abc"),
                entry(1, 2, "plain"),
                entry(2, 3, "https://pan.quark.cn/s/xyz"),
            ])
            .expect("insert");

        let page = store
            .scan_text_after(0, &["pan.baidu.com", "pan.quark.cn"], 10)
            .expect("scan");
        assert_eq!(page.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2, 3]);
        let after = store.scan_text_after(2, &["pan."], 10).expect("scan");
        assert_eq!(after.len(), 1);

        assert_eq!(store.delete_entries(&[3, 3, 99]).expect("delete"), 1);
        assert_eq!(store.count().expect("count"), 2);
    }
}
