//! Database schema definitions.
//!
//! All DDL is idempotent and applied on every startup.

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;

/// Non-billable events accepted from agents.
///
/// `deleted_at` marks rows removed by retention; live rows have it NULL.
pub const LOG_ENTRIES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    rule_name   TEXT NOT NULL DEFAULT '',
    rule_desc   TEXT NOT NULL DEFAULT '',
    log_line    TEXT NOT NULL,
    log_file    TEXT NOT NULL DEFAULT '',
    pattern     TEXT NOT NULL DEFAULT '',
    tag         TEXT NOT NULL DEFAULT '',
    source      TEXT NOT NULL DEFAULT 'agent',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    deleted_at  INTEGER
);
CREATE INDEX IF NOT EXISTS idx_log_entries_timestamp ON log_entries (timestamp);
CREATE INDEX IF NOT EXISTS idx_log_entries_tag ON log_entries (tag);
CREATE INDEX IF NOT EXISTS idx_log_entries_deleted_at ON log_entries (deleted_at);
"#;

/// Daily billing aggregates. The composite key is the upsert target.
pub const BILLING_ENTRIES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS billing_entries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    date        TEXT NOT NULL,
    bill_key    TEXT NOT NULL,
    tag         TEXT NOT NULL DEFAULT '',
    count       INTEGER NOT NULL DEFAULT 0,
    amount      REAL NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    UNIQUE (date, bill_key, tag)
);
"#;

/// Tag projects. At most one row may have `type = 'billing'`.
pub const TAG_PROJECTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS tag_projects (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    type        TEXT NOT NULL DEFAULT 'normal',
    description TEXT NOT NULL DEFAULT '',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tag_projects_single_billing
    ON tag_projects (type) WHERE type = 'billing';
"#;

/// Canonical tag registry.
pub const TAGS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS tags (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    project_id  INTEGER REFERENCES tag_projects (id),
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tags_project_id ON tags (project_id);
"#;

/// Canonical rule name registry.
pub const RULE_NAMES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS rule_names (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
"#;

/// Billing rules edited by administrators.
pub const BILLING_CONFIGS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS billing_configs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    bill_key    TEXT NOT NULL,
    billing_tag TEXT NOT NULL DEFAULT '',
    match_type  TEXT NOT NULL,
    match_value TEXT NOT NULL DEFAULT '',
    unit_price  REAL NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
"#;

/// Running count of live log entries per tag.
pub const TAG_LOG_COUNTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS tag_log_counts (
    tag          TEXT PRIMARY KEY,
    count        INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
    last_updated INTEGER NOT NULL
);
"#;

/// Agent metric reports.
pub const METRICS_ENTRIES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS metrics_entries (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    rule_counts TEXT NOT NULL DEFAULT '{}',
    total_count INTEGER NOT NULL DEFAULT 0,
    duration    INTEGER NOT NULL DEFAULT 0,
    tag         TEXT NOT NULL DEFAULT '',
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_entries_timestamp ON metrics_entries (timestamp);
"#;

/// Initialize the database schema.
///
/// Creates all necessary tables and indexes if they don't exist.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    for ddl in [
        LOG_ENTRIES_TABLE_DDL,
        BILLING_ENTRIES_TABLE_DDL,
        TAG_PROJECTS_TABLE_DDL,
        TAGS_TABLE_DDL,
        RULE_NAMES_TABLE_DDL,
        BILLING_CONFIGS_TABLE_DDL,
        TAG_LOG_COUNTS_TABLE_DDL,
        METRICS_ENTRIES_TABLE_DDL,
    ] {
        sqlx::raw_sql(ddl).execute(pool.inner()).await?;
    }

    tracing::info!("Database schema initialized");
    Ok(())
}
