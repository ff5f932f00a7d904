//! User-facing storage facades.
//!
//! Each facade owns a clone of the pool and exposes the primitives one part of
//! the pipeline needs:
//! - `IngestStore`: atomic flush commit (billing upserts, log inserts, tag counts)
//! - `RegistryStore`: tag / rule name reference tables and paged backfill scans
//! - `RetentionStore`: paged deletion of expired rows
//! - `MetricsStore`: metric report inserts

use std::collections::BTreeMap;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::types::{FlushBatch, MetricsRecord, split_tags};

// =============================================================================
// Constants
// =============================================================================

/// Rows per multi-row INSERT statement.
const INSERT_CHUNK: usize = 50;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Apply signed per-tag deltas to `tag_log_counts`, clamping at zero.
async fn apply_tag_deltas(
    conn: &mut SqliteConnection,
    deltas: &BTreeMap<String, i64>,
    now: i64,
) -> Result<(), StorageError> {
    for (tag, delta) in deltas {
        if *delta == 0 {
            continue;
        }
        sqlx::query(
            "INSERT INTO tag_log_counts (tag, count, last_updated) VALUES (?, MAX(?, 0), ?)
             ON CONFLICT (tag) DO UPDATE SET
                 count = MAX(count + ?, 0),
                 last_updated = excluded.last_updated",
        )
        .bind(tag)
        .bind(delta)
        .bind(now)
        .bind(delta)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// =============================================================================
// Ingest
// =============================================================================

/// A persisted daily billing aggregate.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BillingTotals {
    pub date: String,
    pub bill_key: String,
    pub tag: String,
    pub count: i64,
    pub amount: f64,
}

/// Persistence for classified batches.
#[derive(Clone)]
pub struct IngestStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for IngestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestStore").finish_non_exhaustive()
    }
}

impl IngestStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Commit every side effect of one flush in a single transaction.
    ///
    /// Returns the ids of the inserted log entries. On error nothing is written.
    pub async fn commit_flush(&self, batch: &FlushBatch) -> Result<Vec<i64>, StorageError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_millis();
        let mut tx = self.pool.begin_write().await?;

        for chunk in batch.billing.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "INSERT INTO billing_entries (date, bill_key, tag, count, amount, created_at, updated_at) ",
            );
            qb.push_values(chunk, |mut b, delta| {
                b.push_bind(delta.date.clone())
                    .push_bind(delta.bill_key.clone())
                    .push_bind(delta.tag.clone())
                    .push_bind(delta.count)
                    .push_bind(delta.amount)
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT (date, bill_key, tag) DO UPDATE SET
                     count = count + excluded.count,
                     amount = amount + excluded.amount,
                     updated_at = excluded.updated_at",
            );
            qb.build().execute(&mut *tx).await?;
        }

        let mut ids = Vec::with_capacity(batch.logs.len());
        for chunk in batch.logs.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "INSERT INTO log_entries (timestamp, rule_name, rule_desc, log_line, log_file, pattern, tag, source, created_at, updated_at) ",
            );
            qb.push_values(chunk, |mut b, entry| {
                b.push_bind(entry.timestamp)
                    .push_bind(entry.rule_name.clone())
                    .push_bind(entry.rule_desc.clone())
                    .push_bind(entry.log_line.clone())
                    .push_bind(entry.log_file.clone())
                    .push_bind(entry.pattern.clone())
                    .push_bind(entry.tag.clone())
                    .push_bind(entry.source.clone())
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(" RETURNING id");
            let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(&mut *tx).await?;
            ids.extend(rows.into_iter().map(|(id,)| id));
        }

        apply_tag_deltas(&mut tx, &batch.tag_deltas, now).await?;

        tx.commit().await?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Look up one billing aggregate.
    pub async fn billing_totals(
        &self,
        date: &str,
        bill_key: &str,
        tag: &str,
    ) -> Result<Option<BillingTotals>, StorageError> {
        let row: Option<(String, String, String, i64, f64)> = sqlx::query_as(
            "SELECT date, bill_key, tag, count, amount FROM billing_entries
             WHERE date = ? AND bill_key = ? AND tag = ?",
        )
        .bind(date)
        .bind(bill_key)
        .bind(tag)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(|(date, bill_key, tag, count, amount)| BillingTotals {
            date,
            bill_key,
            tag,
            count,
            amount,
        }))
    }

    /// Number of billing aggregate rows.
    pub async fn count_billing_entries(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM billing_entries")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(count)
    }

    /// Number of live log entries, optionally restricted to an exact tag field.
    pub async fn count_live_logs(&self, tag: Option<&str>) -> Result<i64, StorageError> {
        let (count,): (i64,) = match tag {
            Some(tag) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM log_entries WHERE deleted_at IS NULL AND tag = ?",
                )
                .bind(tag)
                .fetch_one(self.pool.inner())
                .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM log_entries WHERE deleted_at IS NULL")
                    .fetch_one(self.pool.inner())
                    .await?
            }
        };
        Ok(count)
    }

    /// Current live log count for a tag (0 when never seen).
    pub async fn tag_log_count(&self, tag: &str) -> Result<i64, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT count FROM tag_log_counts WHERE tag = ?")
            .bind(tag)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(row.map(|(c,)| c).unwrap_or(0))
    }

    /// Round-trip a trivial query, used by readiness probes.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(self.pool.inner()).await?;
        Ok(())
    }
}

// =============================================================================
// Registries
// =============================================================================

/// Which reference table a registry mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Tag,
    RuleName,
}

/// Historical column scanned to seed a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillSource {
    /// `log_entries.tag` of live rows (comma-joined).
    LogTags,
    /// `log_entries.rule_name` of live rows.
    LogRuleNames,
    /// `billing_entries.tag` (comma-joined).
    BillingTags,
}

impl RegistryKind {
    fn table(self) -> &'static str {
        match self {
            Self::Tag => "tags",
            Self::RuleName => "rule_names",
        }
    }

    /// Human-readable label for logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::RuleName => "rule name",
        }
    }

    /// Historical columns this registry is seeded from.
    pub fn backfill_sources(self) -> &'static [BackfillSource] {
        match self {
            Self::Tag => &[BackfillSource::LogTags, BackfillSource::BillingTags],
            Self::RuleName => &[BackfillSource::LogRuleNames],
        }
    }
}

impl BackfillSource {
    fn page_sql(self) -> &'static str {
        match self {
            Self::LogTags => {
                "SELECT id, tag FROM log_entries
                 WHERE deleted_at IS NULL AND id > ? AND tag != ''
                 ORDER BY id LIMIT ?"
            }
            Self::LogRuleNames => {
                "SELECT id, rule_name FROM log_entries
                 WHERE deleted_at IS NULL AND id > ? AND rule_name != ''
                 ORDER BY id LIMIT ?"
            }
            Self::BillingTags => {
                "SELECT id, tag FROM billing_entries
                 WHERE id > ? AND tag != ''
                 ORDER BY id LIMIT ?"
            }
        }
    }

    /// Whether values from this source are comma-joined tag lists.
    pub fn is_tag_list(self) -> bool {
        matches!(self, Self::LogTags | Self::BillingTags)
    }
}

/// Reference tables behind the tag and rule name registries.
#[derive(Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for RegistryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryStore").finish_non_exhaustive()
    }
}

impl RegistryStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a name if absent. Idempotent.
    pub async fn insert(&self, kind: RegistryKind, name: &str) -> Result<(), StorageError> {
        let now = now_millis();
        let sql = format!(
            "INSERT INTO {} (name, created_at, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (name) DO NOTHING",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(name)
            .bind(now)
            .bind(now)
            .execute(self.pool.inner())
            .await?;
        Ok(())
    }

    /// Insert many names in one transaction. Existing names are skipped.
    pub async fn insert_many(
        &self,
        kind: RegistryKind,
        names: &[String],
    ) -> Result<(), StorageError> {
        if names.is_empty() {
            return Ok(());
        }

        let now = now_millis();
        let mut tx = self.pool.begin_write().await?;
        for chunk in names.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "INSERT INTO {} (name, created_at, updated_at) ",
                kind.table()
            ));
            qb.push_values(chunk, |mut b, name| {
                b.push_bind(name.clone()).push_bind(now).push_bind(now);
            });
            qb.push(" ON CONFLICT (name) DO NOTHING");
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All registered names.
    pub async fn list(&self, kind: RegistryKind) -> Result<Vec<String>, StorageError> {
        let sql = format!("SELECT name FROM {} ORDER BY id", kind.table());
        let rows: Vec<(String,)> = sqlx::query_as(&sql).fetch_all(self.pool.inner()).await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// Number of registered names.
    pub async fn count(&self, kind: RegistryKind) -> Result<i64, StorageError> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(self.pool.inner()).await?;
        Ok(count)
    }

    /// One keyset page of a historical column: rows with `id > after_id`, ascending.
    pub async fn scan_page(
        &self,
        source: BackfillSource,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<(i64, String)>, StorageError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(source.page_sql())
            .bind(after_id)
            .bind(limit)
            .fetch_all(self.pool.inner())
            .await?;
        Ok(rows)
    }

    /// True when no tag has a recorded log count.
    pub async fn tag_log_counts_empty(&self) -> Result<bool, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tag_log_counts LIMIT 1")
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(row.is_none())
    }

    /// Apply signed per-tag deltas to the live log counts in one transaction.
    pub async fn apply_tag_deltas(
        &self,
        deltas: &BTreeMap<String, i64>,
    ) -> Result<(), StorageError> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin_write().await?;
        apply_tag_deltas(&mut tx, deltas, now_millis()).await?;
        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// Retention
// =============================================================================

/// Paged deletion of expired rows.
#[derive(Clone)]
pub struct RetentionStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for RetentionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionStore").finish_non_exhaustive()
    }
}

impl RetentionStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Soft-delete one page of live log entries older than `cutoff` (unix seconds).
    ///
    /// The page is marked first and the tag count decrement derived from the
    /// marked rows, both in one write transaction, so a flush committing
    /// meanwhile waits instead of aborting the sweep. Returns the number of
    /// rows removed; 0 means nothing expired remains.
    pub async fn soft_delete_expired_logs(
        &self,
        cutoff: i64,
        limit: i64,
    ) -> Result<u64, StorageError> {
        let now = now_millis();
        let mut tx = self.pool.begin_write().await?;

        let marked: Vec<(String,)> = sqlx::query_as(
            "UPDATE log_entries SET deleted_at = ?, updated_at = ?
             WHERE id IN (
                 SELECT id FROM log_entries
                 WHERE deleted_at IS NULL AND timestamp < ?
                 ORDER BY id LIMIT ?
             )
             RETURNING tag",
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if marked.is_empty() {
            return Ok(0);
        }

        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for (tag,) in &marked {
            for t in split_tags(tag) {
                *deltas.entry(t.to_string()).or_default() -= 1;
            }
        }
        apply_tag_deltas(&mut tx, &deltas, now).await?;

        tx.commit().await?;
        Ok(marked.len() as u64)
    }

    /// Delete one page of metric reports older than `cutoff` (unix seconds).
    pub async fn delete_expired_metrics(
        &self,
        cutoff: i64,
        limit: i64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM metrics_entries WHERE id IN (
                 SELECT id FROM metrics_entries WHERE timestamp < ? ORDER BY id LIMIT ?
             )",
        )
        .bind(cutoff)
        .bind(limit)
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Metric report persistence.
#[derive(Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for MetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsStore").finish_non_exhaustive()
    }
}

impl MetricsStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert reports in one transaction, returning their ids.
    pub async fn insert_batch(&self, records: &[MetricsRecord]) -> Result<Vec<i64>, StorageError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let encoded = records
            .iter()
            .map(|r| serde_json::to_string(&r.rule_counts))
            .collect::<Result<Vec<_>, _>>()?;

        let now = now_millis();
        let mut tx = self.pool.begin_write().await?;
        let mut ids = Vec::with_capacity(records.len());

        for (chunk, counts) in records
            .chunks(INSERT_CHUNK)
            .zip(encoded.chunks(INSERT_CHUNK))
        {
            let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "INSERT INTO metrics_entries (timestamp, rule_counts, total_count, duration, tag, created_at, updated_at) ",
            );
            qb.push_values(chunk.iter().zip(counts), |mut b, (record, rule_counts)| {
                b.push_bind(record.timestamp)
                    .push_bind(rule_counts.clone())
                    .push_bind(record.total_count)
                    .push_bind(record.duration)
                    .push_bind(record.tag.clone())
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(" RETURNING id");
            let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(&mut *tx).await?;
            ids.extend(rows.into_iter().map(|(id,)| id));
        }

        tx.commit().await?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Reports stored for a tag, oldest first.
    pub async fn list_by_tag(&self, tag: &str) -> Result<Vec<MetricsRecord>, StorageError> {
        let rows: Vec<(i64, String, i64, i64, String)> = sqlx::query_as(
            "SELECT timestamp, rule_counts, total_count, duration, tag FROM metrics_entries
             WHERE tag = ? ORDER BY timestamp, id",
        )
        .bind(tag)
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter()
            .map(|(timestamp, rule_counts, total_count, duration, tag)| {
                Ok(MetricsRecord {
                    timestamp,
                    rule_counts: serde_json::from_str(&rule_counts)?,
                    total_count,
                    duration,
                    tag,
                })
            })
            .collect()
    }

    /// Number of stored reports.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metrics_entries")
            .fetch_one(self.pool.inner())
            .await?;
        Ok(count)
    }
}
