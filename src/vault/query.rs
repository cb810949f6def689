//! Read-side queries over an [`ArchiveStore`]: paging, keyword search and
//! reaction aggregates.

use crate::vault::model::Entry;
use crate::vault::store::{ArchiveStore, ENTRY_COLUMNS, entry_from_row};
use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_REACTION_PAGE_LIMIT: usize = 100;

/// An entry as handed to readers: the stored row plus the entry it replies
/// to, when that one is archived too.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedEntry {
    #[serde(flatten)]
    pub entry: Entry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Box<Entry>>,
    /// Position in the archive's time order; set by search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    /// Count of the reaction the page was sorted by.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryPage {
    pub total: u64,
    pub offset: u64,
    pub entries: Vec<ArchivedEntry>,
}

impl EntryPage {
    pub fn empty() -> Self {
        Self {
            total: 0,
            offset: 0,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub total: u64,
    pub results: Vec<ArchivedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionTotal {
    pub emoticon: String,
    pub count: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SearchTerms {
    include: Vec<String>,
    exclude: Vec<String>,
}

fn parse_terms(query: &str) -> SearchTerms {
    let mut terms = SearchTerms::default();
    for raw in query.to_lowercase().split_whitespace() {
        match raw.strip_prefix('-') {
            Some("") => {}
            Some(negated) => terms.exclude.push(negated.to_string()),
            None => terms.include.push(raw.to_string()),
        }
    }
    terms
}

fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

const SEARCH_COLUMNS: [&str; 3] = ["captured_at", "body_text", "attachment_path"];

/// `(col LIKE ? OR ...)` for one term, binding into `values`. Columns go
/// through `fold_case` so both sides are lowercased the same way.
fn term_clause(term: &str, values: &mut Vec<SqlValue>) -> String {
    let pattern = like_pattern(term);
    let parts = SEARCH_COLUMNS
        .iter()
        .map(|column| {
            values.push(SqlValue::Text(pattern.clone()));
            format!(
                "fold_case(COALESCE(m.{column}, '')) LIKE ?{} ESCAPE '\\'",
                values.len()
            )
        })
        .collect::<Vec<_>>();
    format!("({})", parts.join(" OR "))
}

fn attach_reply(conn: &Connection, source_id: &str, entry: Entry) -> Result<ArchivedEntry> {
    let reply_to = match entry.reply_target_id {
        Some(target) => conn
            .query_row(
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM messages WHERE source_id = ?1 AND entry_id = ?2"
                ),
                params![source_id, target],
                entry_from_row,
            )
            .optional()?
            .map(Box::new),
        None => None,
    };
    Ok(ArchivedEntry {
        entry,
        reply_to,
        index: None,
        reaction_count: None,
    })
}

fn count_rows(conn: &Connection, source_id: &str) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE source_id = ?1",
        params![source_id],
        |r| r.get(0),
    )?;
    Ok(total.max(0) as u64)
}

impl ArchiveStore {
    /// One page in `(captured_ts, entry_id)` order. A negative `offset`
    /// counts back from the end.
    pub fn page(&self, offset: i64, limit: usize) -> Result<EntryPage> {
        let conn = self.connect()?;
        let total = count_rows(&conn, self.source_id())?;
        let offset = if offset < 0 {
            (total as i64 + offset).max(0) as u64
        } else {
            offset as u64
        };

        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM messages WHERE source_id = ?1
             ORDER BY captured_ts, entry_id LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![self.source_id(), limit as i64, offset as i64],
                entry_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let entries = rows
            .into_iter()
            .map(|entry| attach_reply(&conn, self.source_id(), entry))
            .collect::<Result<Vec<_>>>()?;
        Ok(EntryPage {
            total,
            offset,
            entries,
        })
    }

    pub fn entry(&self, entry_id: i64) -> Result<Option<ArchivedEntry>> {
        let Some(entry) = self.get(entry_id)? else {
            return Ok(None);
        };
        let conn = self.connect()?;
        attach_reply(&conn, self.source_id(), entry).map(Some)
    }

    /// Whitespace-separated AND terms; `-term` excludes. Matching is a
    /// case-insensitive substring test over time, text and attachment path.
    pub fn search(&self, query: &str) -> Result<SearchResults> {
        let conn = self.connect()?;
        let terms = parse_terms(query);
        if terms.include.is_empty() && terms.exclude.is_empty() {
            return Ok(SearchResults {
                total: count_rows(&conn, self.source_id())?,
                results: Vec::new(),
            });
        }

        let mut values = vec![SqlValue::Text(self.source_id().to_string())];
        let mut clauses = Vec::new();
        for term in &terms.include {
            clauses.push(term_clause(term, &mut values));
        }
        for term in &terms.exclude {
            clauses.push(format!("NOT {}", term_clause(term, &mut values)));
        }
        let where_clause = clauses.join(" AND ");
        let columns = ENTRY_COLUMNS
            .split(',')
            .map(|c| format!("m.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "SELECT {columns},
                (SELECT COUNT(*) FROM messages m2
                 WHERE m2.source_id = m.source_id
                   AND (m2.captured_ts < m.captured_ts
                        OR (m2.captured_ts = m.captured_ts AND m2.entry_id < m.entry_id))) AS idx
             FROM messages m
             WHERE m.source_id = ?1 AND {where_clause}
             ORDER BY m.captured_ts, m.entry_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((entry_from_row(row)?, row.get::<_, i64>(13)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut results = Vec::with_capacity(rows.len());
        for (entry, index) in rows {
            let mut item = attach_reply(&conn, self.source_id(), entry)?;
            item.index = Some(index.max(0) as u64);
            results.push(item);
        }
        Ok(SearchResults {
            total: results.len() as u64,
            results,
        })
    }

    fn reaction_rows(&self, conn: &Connection) -> Result<Vec<(i64, i64, String)>> {
        let mut stmt = conn.prepare(
            "SELECT entry_id, captured_ts, reactions FROM messages
             WHERE source_id = ?1 AND reactions IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![self.source_id()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Totals per emoticon, largest first, ties by emoticon.
    pub fn reaction_totals(&self) -> Result<Vec<ReactionTotal>> {
        let conn = self.connect()?;
        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for (_, _, blob) in self.reaction_rows(&conn)? {
            let Ok(summary) = serde_json::from_str::<crate::vault::model::ReactionSummary>(&blob)
            else {
                continue;
            };
            for count in summary.counts {
                *totals.entry(count.emoticon).or_default() += count.count;
            }
        }
        let mut out = totals
            .into_iter()
            .map(|(emoticon, count)| ReactionTotal { emoticon, count })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.emoticon.cmp(&b.emoticon)));
        Ok(out)
    }

    /// Entries carrying `emoticon`, most reacted first, then newest, then
    /// highest id. `limit` is clamped to `1..=100`.
    pub fn by_reaction(&self, emoticon: &str, offset: usize, limit: usize) -> Result<EntryPage> {
        let emoticon = emoticon.trim();
        let conn = self.connect()?;
        let limit = limit.clamp(1, MAX_REACTION_PAGE_LIMIT);

        let mut scored = Vec::new();
        for (entry_id, ts, blob) in self.reaction_rows(&conn)? {
            let Ok(summary) = serde_json::from_str::<crate::vault::model::ReactionSummary>(&blob)
            else {
                continue;
            };
            let count = summary.count_for(emoticon);
            if count > 0 {
                scored.push((count, ts, entry_id));
            }
        }
        scored.sort_by(|a, b| b.cmp(a));
        let total = scored.len() as u64;

        let mut entries = Vec::new();
        for (count, _, entry_id) in scored.into_iter().skip(offset).take(limit) {
            let Some(entry) = conn
                .query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM messages WHERE source_id = ?1 AND entry_id = ?2"
                    ),
                    params![self.source_id(), entry_id],
                    entry_from_row,
                )
                .optional()?
            else {
                continue;
            };
            let mut item = attach_reply(&conn, self.source_id(), entry)?;
            item.reaction_count = Some(count);
            entries.push(item);
        }
        Ok(EntryPage {
            total,
            offset: offset as u64,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SearchTerms, like_pattern, parse_terms};
    use crate::vault::model::{ReactionCount, ReactionSummary};
    use crate::vault::store::tests::{entry, store};

    fn reactions(pairs: &[(&str, u64)]) -> Option<ReactionSummary> {
        Some(ReactionSummary {
            counts: pairs
                .iter()
                .map(|(e, c)| ReactionCount {
                    emoticon: e.to_string(),
                    count: *c,
                })
                .collect(),
        })
    }

    #[test]
    fn terms_split_into_include_and_exclude() {
        assert_eq!(
            parse_terms("Rust -java  - SQL"),
            SearchTerms {
                include: vec!["rust".to_string(), "sql".to_string()],
                exclude: vec!["java".to_string()],
            }
        );
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn page_supports_negative_offset_and_embeds_replies() {
        let (_tmp, store) = store();
        let mut reply = entry(3, 30, "answer");
        reply.reply_target_id = Some(1);
        store
            .insert_entries(&[entry(1, 10, "question"), entry(2, 20, "noise"), reply])
            .expect("insert");

        let page = store.page(-1, 20).expect("page");
        assert_eq!(page.total, 3);
        assert_eq!(page.offset, 2);
        assert_eq!(page.entries.len(), 1);
        let embedded = page.entries[0].reply_to.as_ref().expect("reply");
        assert_eq!(embedded.body_text, "question");

        let all = store.page(-10, 2).expect("page");
        assert_eq!(all.offset, 0);
        assert_eq!(
            all.entries.iter().map(|e| e.entry.entry_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn search_applies_and_terms_negation_and_index() {
        let (_tmp, store) = store();
        let mut with_file = entry(4, 40, "");
        with_file.attachment_path = Some("downloads/src/src_4_Report.pdf".to_string());
        store
            .insert_entries(&[
                entry(1, 10, "Rust async notes"),
                entry(2, 20, "rust and java"),
                entry(3, 30, "python only"),
                with_file,
            ])
            .expect("insert");

        let hits = store.search("RUST -java").expect("search");
        assert_eq!(hits.total, 1);
        assert_eq!(hits.results[0].entry.entry_id, 1);
        assert_eq!(hits.results[0].index, Some(0));

        let by_file = store.search("report").expect("search");
        assert_eq!(by_file.results[0].index, Some(3));

        let empty = store.search("   ").expect("search");
        assert_eq!(empty.total, 4);
        assert!(empty.results.is_empty());

        assert_eq!(store.search("100%").expect("search").total, 0);
    }

    #[test]
    fn search_folds_non_ascii_case() {
        let (_tmp, store) = store();
        store
            .insert_entries(&[
                entry(1, 10, "Überweisung erhalten"),
                entry(2, 20, "ΑΘΗΝΑ trip"),
                entry(3, 30, "plain"),
            ])
            .expect("insert");

        let hits = store.search("überweisung").expect("search");
        assert_eq!(hits.total, 1);
        assert_eq!(hits.results[0].entry.entry_id, 1);
        assert_eq!(store.search("ΑΘήνα").expect("search").total, 0);
        assert_eq!(store.search("αθηνα").expect("search").total, 1);
        assert_eq!(store.search("-Ü").expect("search").total, 2);
    }

    #[test]
    fn reaction_queries_sort_and_clamp() {
        let (_tmp, store) = store();
        let mut a = entry(1, 10, "a");
        a.reaction_summary = reactions(&[("👍", 2), ("🔥", 1)]);
        let mut b = entry(2, 20, "b");
        b.reaction_summary = reactions(&[("👍", 5)]);
        let mut c = entry(3, 30, "c");
        c.reaction_summary = reactions(&[("👍", 2)]);
        store
            .insert_entries(&[a, b, c, entry(4, 40, "none")])
            .expect("insert");

        let totals = store.reaction_totals().expect("totals");
        assert_eq!(totals[0].emoticon, "👍");
        assert_eq!(totals[0].count, 9);
        assert_eq!(totals[1].count, 1);

        let page = store.by_reaction("👍", 0, 0).expect("by reaction");
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].entry.entry_id, 2);
        assert_eq!(page.entries[0].reaction_count, Some(5));

        let rest = store.by_reaction("👍", 1, 500).expect("by reaction");
        assert_eq!(
            rest.entries.iter().map(|e| e.entry.entry_id).collect::<Vec<_>>(),
            vec![3, 1]
        );
    }
}
