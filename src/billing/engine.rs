//! Billing classification engine.
//!
//! Splits every batch into billing aggregate increments, ordinary log
//! entries and unmatched records, then commits the durable part in one
//! transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Local, Utc};

use super::index::BillingConfigCache;
use super::unmatched::UnmatchedRing;
use crate::ingest::{BatchOutcome, BatchProcessor, IngestError, RawEvent};
use crate::registry::Registry;
use crate::storage::{BillingDelta, FlushBatch, IngestStore};

/// Time zone used to turn event timestamps into billing dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DayZone {
    /// The process local zone.
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl DayZone {
    pub fn from_offset(offset: Option<FixedOffset>) -> Self {
        offset.map_or(Self::Local, Self::Fixed)
    }

    /// `YYYY-MM-DD` for a unix timestamp in seconds, or `None` when the day
    /// falls outside years 1 through 9999.
    pub fn date_of(&self, timestamp: i64) -> Option<String> {
        let utc = DateTime::<Utc>::from_timestamp(timestamp, 0)?;
        let day = match self {
            Self::Local => utc.with_timezone(&Local).date_naive(),
            Self::Fixed(offset) => utc.with_timezone(offset).date_naive(),
        };
        (1..=9999)
            .contains(&day.year())
            .then(|| day.format("%Y-%m-%d").to_string())
    }
}

/// Aggregate key: `(date, bill_key, tag)`.
type AggregateKey = (String, String, String);

/// The batch processor behind every receiver.
#[derive(Clone)]
pub struct BillingEngine {
    store: IngestStore,
    index: Arc<BillingConfigCache>,
    tags: Registry,
    rule_names: Registry,
    unmatched: Arc<UnmatchedRing>,
    zone: DayZone,
}

impl std::fmt::Debug for BillingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingEngine")
            .field("zone", &self.zone)
            .field("unmatched", &self.unmatched)
            .finish_non_exhaustive()
    }
}

impl BillingEngine {
    pub fn new(
        store: IngestStore,
        index: Arc<BillingConfigCache>,
        tags: Registry,
        rule_names: Registry,
        unmatched: Arc<UnmatchedRing>,
    ) -> Self {
        Self {
            store,
            index,
            tags,
            rule_names,
            unmatched,
            zone: DayZone::Local,
        }
    }

    pub fn with_zone(mut self, zone: DayZone) -> Self {
        self.zone = zone;
        self
    }

    pub fn index(&self) -> &Arc<BillingConfigCache> {
        &self.index
    }

    pub fn unmatched(&self) -> &Arc<UnmatchedRing> {
        &self.unmatched
    }

    /// Register the event's tags and rule name. Failures are only logged.
    async fn register(&self, event: &RawEvent) {
        for tag in event.tags() {
            if let Err(e) = self.tags.ensure(tag).await {
                tracing::warn!(tag, error = %e, "Tag registration failed");
            }
        }
        if let Err(e) = self.rule_names.ensure(&event.rule_name).await {
            tracing::warn!(rule_name = %event.rule_name, error = %e, "Rule name registration failed");
        }
    }
}

#[async_trait::async_trait]
impl BatchProcessor for BillingEngine {
    async fn process_batch(&self, events: Vec<RawEvent>) -> Result<BatchOutcome, IngestError> {
        if events.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let index = self.index.get().await?;

        let mut failed = 0;
        let mut increments = 0;
        let mut aggregates: BTreeMap<AggregateKey, (i64, f64)> = BTreeMap::new();
        let mut batch = FlushBatch::default();

        for event in events {
            if !event.is_valid() {
                failed += 1;
                continue;
            }
            self.register(&event).await;

            let tags: Vec<&str> = event.tags().collect();
            if !index.is_billable(&tags) {
                for tag in &tags {
                    *batch.tag_deltas.entry((*tag).to_string()).or_default() += 1;
                }
                batch.logs.push(event.into_log_entry());
                continue;
            }

            let Some(date) = self.zone.date_of(event.timestamp) else {
                tracing::debug!(timestamp = event.timestamp, "Billable event has no calendar day");
                failed += 1;
                continue;
            };
            let tag = event.tag.trim();
            let mut matched = 0;
            for rule in index.matching_rules(&event, &tags) {
                let slot = aggregates
                    .entry((date.clone(), rule.bill_key.clone(), tag.to_string()))
                    .or_default();
                slot.0 += 1;
                slot.1 += rule.unit_price;
                matched += 1;
            }

            if matched == 0 {
                self.unmatched.record(tag, &event.rule_name, &event.log_line);
            }
            increments += matched;
        }

        batch.billing = aggregates
            .into_iter()
            .map(|((date, bill_key, tag), (count, amount))| BillingDelta {
                date,
                bill_key,
                tag,
                count,
                amount,
            })
            .collect();

        let logs = batch.logs.len();
        let inserted_ids = if batch.is_empty() {
            Vec::new()
        } else {
            self.store.commit_flush(&batch).await?
        };

        Ok(BatchOutcome {
            succeeded: increments + logs,
            failed,
            inserted_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MatchType, NewBillingConfig, StorageBuilder, StorageHandles};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        handles: StorageHandles,
        engine: BillingEngine,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let handles = StorageBuilder::from_path(dir.path().join("engine.db"))
            .build()
            .await
            .unwrap();
        let cache = Arc::new(BillingConfigCache::new(
            handles.billing.clone(),
            Duration::from_secs(60),
        ));
        let engine = BillingEngine::new(
            handles.ingest.clone(),
            cache,
            Registry::tags(handles.registry.clone()),
            Registry::rule_names(handles.registry.clone()),
            Arc::new(UnmatchedRing::new(100)),
        )
        .with_zone(DayZone::Fixed(FixedOffset::east_opt(0).unwrap()));
        Fixture {
            handles,
            engine,
            _dir: dir,
        }
    }

    async fn add_rule(f: &Fixture, match_type: MatchType, value: &str, bill_key: &str, price: f64) {
        f.handles
            .billing
            .create_config(&NewBillingConfig {
                bill_key: bill_key.to_string(),
                billing_tag: "billing-x".to_string(),
                match_type,
                match_value: value.to_string(),
                unit_price: price,
                description: String::new(),
            })
            .await
            .unwrap();
        f.engine.index().invalidate();
    }

    async fn make_billing_tag(f: &Fixture, tag: &str) {
        f.handles
            .billing
            .assign_tag_project(tag, Some("billing"))
            .await
            .unwrap();
        f.engine.index().invalidate();
    }

    fn event(tag: &str, rule_name: &str, log_line: &str) -> RawEvent {
        RawEvent {
            timestamp: 1_700_000_000,
            tag: tag.to_string(),
            rule_name: rule_name.to_string(),
            log_line: log_line.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_day_zone() {
        let utc = DayZone::Fixed(FixedOffset::east_opt(0).unwrap());
        assert_eq!(utc.date_of(1_700_000_000).as_deref(), Some("2023-11-14"));
        let east8 = DayZone::Fixed(FixedOffset::east_opt(8 * 3600).unwrap());
        assert_eq!(east8.date_of(1_699_980_000).as_deref(), Some("2023-11-15"));
        assert_eq!(utc.date_of(i64::MAX), None);
        assert_eq!(utc.date_of(253_402_300_800), None);
        assert_eq!(utc.date_of(253_402_300_799).as_deref(), Some("9999-12-31"));
        assert_eq!(DayZone::from_offset(None), DayZone::Local);
    }

    #[tokio::test]
    async fn test_billable_tag_match() {
        let f = fixture().await;
        make_billing_tag(&f, "billing-x").await;
        add_rule(&f, MatchType::Tag, "billing-x", "bk", 0.01).await;

        let outcome = f
            .engine
            .process_batch(vec![event("billing-x", "r1", "hit")])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 1);
        assert!(outcome.inserted_ids.is_empty());

        let totals = f
            .handles
            .ingest
            .billing_totals("2023-11-14", "bk", "billing-x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(totals.count, 1);
        assert!((totals.amount - 0.01).abs() < 1e-9);
        assert_eq!(f.handles.ingest.count_live_logs(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_non_billable_becomes_log_entry() {
        let f = fixture().await;
        make_billing_tag(&f, "billing-x").await;

        let outcome = f
            .engine
            .process_batch(vec![event("ops", "r1", "hit"), event("ops, dev", "r2", "x")])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.inserted_ids.len(), 2);
        assert_eq!(f.handles.ingest.tag_log_count("ops").await.unwrap(), 2);
        assert_eq!(f.handles.ingest.tag_log_count("dev").await.unwrap(), 1);
        assert_eq!(f.handles.ingest.count_billing_entries().await.unwrap(), 0);

        // Tags and rule names were registered on the way through.
        assert!(f.engine.tags.contains("dev"));
        assert!(f.engine.rule_names.contains("r2"));
    }

    #[tokio::test]
    async fn test_unmatched_billable_recorded_only() {
        let f = fixture().await;
        make_billing_tag(&f, "billing-x").await;
        add_rule(&f, MatchType::LogLineContains, "never", "bk", 1.0).await;

        let outcome = f
            .engine
            .process_batch(vec![event("billing-x", "r1", "hit")])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::default());

        let items = f.engine.unmatched().snapshot(10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].tag, "billing-x");
        assert_eq!(items[0].rule_name, "r1");
        assert_eq!(items[0].count, 1);
        assert_eq!(f.handles.ingest.count_live_logs(None).await.unwrap(), 0);
        assert_eq!(f.handles.ingest.count_billing_entries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_every_matching_rule_bills() {
        let f = fixture().await;
        make_billing_tag(&f, "billing-x").await;
        add_rule(&f, MatchType::Tag, "billing", "by-tag", 1.0).await;
        add_rule(&f, MatchType::RuleName, "r", "by-rule", 2.0).await;
        add_rule(&f, MatchType::LogLineContains, "hit", "by-line", 3.0).await;

        let outcome = f
            .engine
            .process_batch(vec![event("billing-x", "r1", "hit"), event("billing-x", "r1", "hit")])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 6);
        assert_eq!(f.handles.ingest.count_billing_entries().await.unwrap(), 3);

        let line = f
            .handles
            .ingest
            .billing_totals("2023-11-14", "by-line", "billing-x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.count, 2);
        assert!((line.amount - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_events_counted_as_failed() {
        let f = fixture().await;
        let mut bad = event("ops", "r", "");
        bad.log_line.clear();
        let mut zero = event("ops", "r", "x");
        zero.timestamp = 0;

        let outcome = f
            .engine
            .process_batch(vec![bad, zero, event("ops", "r", "x")])
            .await
            .unwrap();
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.succeeded, 1);
    }

    #[tokio::test]
    async fn test_billable_event_without_calendar_day_fails() {
        let f = fixture().await;
        make_billing_tag(&f, "billing-x").await;
        add_rule(&f, MatchType::Tag, "billing-x", "bk", 1.0).await;
        let mut far = event("billing-x", "r1", "hit");
        far.timestamp = i64::MAX;

        let outcome = f
            .engine
            .process_batch(vec![far, event("billing-x", "r1", "hit")])
            .await
            .unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(f.handles.ingest.count_billing_entries().await.unwrap(), 1);
        assert!(
            f.handles
                .ingest
                .billing_totals("1970-01-01", "bk", "billing-x")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_storage_failure_reported() {
        let f = fixture().await;
        // Warm the index so only the commit fails.
        f.engine.index().get().await.unwrap();
        f.handles.pool.close().await;

        let result = f.engine.process_batch(vec![event("ops", "r", "x")]).await;
        assert!(matches!(result, Err(IngestError::Storage(_))));
    }
}
