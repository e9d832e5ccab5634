//! SQL migration definitions for the siteport KnowledgeStore.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: versioned kv, current pointers, knowledge, sessions",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Every version of every value ever written. Rows are never updated.
CREATE TABLE IF NOT EXISTS kv_entries (
    namespace  TEXT NOT NULL,
    key        TEXT NOT NULL,
    version    INTEGER NOT NULL,
    value_json TEXT NOT NULL,
    written_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key, version)
);

-- Current-version pointer per key, swapped atomically with the insert.
CREATE TABLE IF NOT EXISTS kv_current (
    namespace TEXT NOT NULL,
    key       TEXT NOT NULL,
    version   INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);

-- Cross-session learnings (append-only).
CREATE TABLE IF NOT EXISTS knowledge_entries (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_key          TEXT NOT NULL,
    successful_component TEXT NOT NULL,
    context_tags_json    TEXT NOT NULL,
    fidelity_observed    REAL NOT NULL,
    recorded_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_pattern ON knowledge_entries(pattern_key);

-- Job sessions
CREATE TABLE IF NOT EXISTS sessions (
    id           TEXT PRIMARY KEY,
    source       TEXT NOT NULL,
    phase        TEXT NOT NULL,
    status       TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    session_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Progress event log",
            sql: r#"
CREATE TABLE IF NOT EXISTS progress_events (
    session_id TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    phase      TEXT NOT NULL,
    status     TEXT NOT NULL,
    detail     TEXT NOT NULL,
    at         TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Session driver leases",
            sql: r#"
-- At most one process drives a session at a time.
CREATE TABLE IF NOT EXISTS session_leases (
    session_id TEXT PRIMARY KEY,
    owner      TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
