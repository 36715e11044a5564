//! SQL migration definitions for the core logic database.
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
            description: "Initial schema: domains, knowledge_items, core_logic_versions, distillation_jobs",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Knowledge scopes (owned by external systems)
CREATE TABLE IF NOT EXISTS domains (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    created_at  TEXT NOT NULL
);

-- Knowledge items (owned by external systems)
CREATE TABLE IF NOT EXISTS knowledge_items (
    id         TEXT PRIMARY KEY,
    domain_id  TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    owner      TEXT NOT NULL,
    title      TEXT NOT NULL,
    content    TEXT NOT NULL,
    tags_json  TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_knowledge_domain ON knowledge_items(domain_id, created_at);

-- Append-only core logic history
CREATE TABLE IF NOT EXISTS core_logic_versions (
    id                TEXT PRIMARY KEY,
    domain_id         TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    version           INTEGER NOT NULL,
    parent_version_id TEXT REFERENCES core_logic_versions(id),
    content_json      TEXT NOT NULL,
    changelog_json    TEXT NOT NULL,
    change_summary    TEXT,
    content_hash      TEXT NOT NULL,
    is_active         INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    UNIQUE(domain_id, version)
);

-- At most one active version per domain
CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_one_active
    ON core_logic_versions(domain_id) WHERE is_active = 1;

-- Distillation job queue
CREATE TABLE IF NOT EXISTS distillation_jobs (
    id           TEXT PRIMARY KEY,
    domain_id    TEXT NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
    owner        TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    priority     INTEGER NOT NULL,
    triggered_by TEXT NOT NULL,
    config_json  TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL,
    started_at   TEXT,
    completed_at TEXT,
    error        TEXT,
    result_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim ON distillation_jobs(status, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_domain ON distillation_jobs(domain_id, status);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
