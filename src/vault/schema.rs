//! SQL schema for a per-source archive.
//!
//! Idempotent; applied whenever an archive is opened. The version is kept in
//! `PRAGMA user_version` so later migrations can gate on it.

pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS messages (
    source_id        TEXT    NOT NULL,
    entry_id         INTEGER NOT NULL,
    captured_at      TEXT    NOT NULL,
    captured_ts      INTEGER NOT NULL,
    attachment_path  TEXT,
    attachment_list  TEXT,             -- JSON array, NULL when empty
    author_tag       TEXT    NOT NULL, -- 'self' | 'other'
    body_text        TEXT    NOT NULL DEFAULT '',
    reply_target_id  INTEGER,
    reactions        TEXT,             -- JSON ReactionSummary
    link_preview     TEXT,             -- JSON LinkPreview
    display_width    INTEGER,
    display_height   INTEGER,
    PRIMARY KEY (source_id, entry_id)
);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT
);

CREATE INDEX IF NOT EXISTS messages_source_ts_idx ON messages(source_id, captured_ts, entry_id);

PRAGMA user_version = 1;
";
