//! SQL migration definitions for the hackcrawl database.
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
    vec![Migration {
        version: 1,
        description: "Initial schema: parents, children, failures, crawl_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Parent records (hackathons)
CREATE TABLE IF NOT EXISTS parents (
    id              TEXT PRIMARY KEY,
    external_id     TEXT NOT NULL UNIQUE,
    slug            TEXT UNIQUE,
    org_id          TEXT NOT NULL DEFAULT '',
    org_name        TEXT NOT NULL DEFAULT '',
    org_slug        TEXT NOT NULL DEFAULT '',
    categories_json TEXT NOT NULL DEFAULT '[]',
    name            TEXT NOT NULL DEFAULT '',
    description     TEXT NOT NULL DEFAULT '',
    url             TEXT NOT NULL DEFAULT '',
    state           TEXT NOT NULL CHECK (state IN ('DISCOVERED', 'DETAILED', 'PROCESSED')),
    children_listed INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_parents_state ON parents(state);

-- Child records (projects); external_id is globally unique
CREATE TABLE IF NOT EXISTS children (
    id          TEXT PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    parent_id   TEXT NOT NULL REFERENCES parents(id) ON DELETE CASCADE,
    title       TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    url         TEXT NOT NULL DEFAULT '',
    tags_json   TEXT NOT NULL DEFAULT '[]',
    state       TEXT NOT NULL CHECK (state IN ('DISCOVERED', 'DETAILED', 'PROCESSED')),
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_children_parent ON children(parent_id);
CREATE INDEX IF NOT EXISTS idx_children_state ON children(state);

-- Records whose retries were exhausted, counted per run
CREATE TABLE IF NOT EXISTS failures (
    kind        TEXT NOT NULL,
    external_id TEXT NOT NULL,
    parent_id   TEXT,
    attempts    INTEGER NOT NULL DEFAULT 1,
    last_error  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (kind, external_id)
);

-- Crawl run history
CREATE TABLE IF NOT EXISTS crawl_runs (
    id          TEXT PRIMARY KEY,
    phase       TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
