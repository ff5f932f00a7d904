//! Cached billing rule index.
//!
//! Readers take a short read lock and clone an `Arc`. Rebuilds are
//! serialized by an async mutex; while one runs, other readers keep using the
//! previous copy. A failed rebuild never discards a working copy.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::rule::{BillingRule, Matcher};
use crate::ingest::RawEvent;
use crate::storage::{BillingConfigRecord, BillingStore, StorageError};

/// Rules partitioned by match type, plus the set of billing tags.
#[derive(Debug, Default)]
pub struct BillingIndex {
    by_tag: Vec<BillingRule>,
    by_rule_name: Vec<BillingRule>,
    by_log_line: Vec<BillingRule>,
    billing_tags: HashSet<String>,
}

impl BillingIndex {
    /// Build from rule rows and the billing project's tag names.
    pub fn build<I, S>(configs: Vec<BillingConfigRecord>, billing_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self {
            billing_tags: billing_tags
                .into_iter()
                .map(|t| t.as_ref().trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            ..Default::default()
        };
        for config in configs {
            let rule = BillingRule::from(config);
            match rule.matcher {
                Matcher::Tag(_) => index.by_tag.push(rule),
                Matcher::RuleName(_) => index.by_rule_name.push(rule),
                Matcher::LogLineContains(_) => index.by_log_line.push(rule),
            }
        }
        index
    }

    /// True when at least one of `tags` belongs to the billing project.
    pub fn is_billable(&self, tags: &[&str]) -> bool {
        tags.iter().any(|t| self.billing_tags.contains(*t))
    }

    /// Every matching rule, tag rules first, then rule name, then log line.
    pub fn matching_rules<'a>(
        &'a self,
        event: &'a RawEvent,
        tags: &'a [&'a str],
    ) -> impl Iterator<Item = &'a BillingRule> + 'a {
        self.by_tag
            .iter()
            .chain(&self.by_rule_name)
            .chain(&self.by_log_line)
            .filter(move |rule| rule.matches(event, tags))
    }

    pub fn rule_count(&self) -> usize {
        self.by_tag.len() + self.by_rule_name.len() + self.by_log_line.len()
    }

    pub fn billing_tags(&self) -> &HashSet<String> {
        &self.billing_tags
    }
}

struct Cached {
    index: Arc<BillingIndex>,
    built_at: Instant,
    generation: u64,
}

/// Holder of the current [`BillingIndex`].
///
/// A copy is fresh while it is younger than the TTL and no
/// [`invalidate`](Self::invalidate) happened since its rebuild started.
pub struct BillingConfigCache {
    store: BillingStore,
    ttl: Duration,
    current: RwLock<Option<Cached>>,
    generation: AtomicU64,
    rebuild: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BillingConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfigCache")
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .field("loaded", &self.current.read().is_some())
            .finish_non_exhaustive()
    }
}

impl BillingConfigCache {
    pub fn new(store: BillingStore, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    /// Force the next read to rebuild.
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "Billing index invalidated");
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Current index, rebuilding it if stale.
    ///
    /// # Errors
    /// Returns the storage error only when a rebuild fails and no earlier
    /// copy exists.
    pub async fn get(&self) -> Result<Arc<BillingIndex>, StorageError> {
        if let Some(index) = self.fresh() {
            return Ok(index);
        }

        let _guard = match self.rebuild.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Someone else is rebuilding. Serve the old copy if there is one.
                if let Some(index) = self.stale() {
                    return Ok(index);
                }
                self.rebuild.lock().await
            }
        };

        // The previous holder may have just finished.
        if let Some(index) = self.fresh() {
            return Ok(index);
        }
        self.rebuild_locked().await
    }

    fn fresh(&self) -> Option<Arc<BillingIndex>> {
        let generation = self.generation();
        self.current
            .read()
            .as_ref()
            .filter(|c| c.generation == generation && c.built_at.elapsed() < self.ttl)
            .map(|c| Arc::clone(&c.index))
    }

    fn stale(&self) -> Option<Arc<BillingIndex>> {
        self.current.read().as_ref().map(|c| Arc::clone(&c.index))
    }

    /// Caller must hold the rebuild mutex.
    async fn rebuild_locked(&self) -> Result<Arc<BillingIndex>, StorageError> {
        // Read before loading so an invalidation racing the load forces another rebuild.
        let generation = self.generation();
        match self.load().await {
            Ok(index) => {
                let index = Arc::new(index);
                tracing::debug!(
                    rules = index.rule_count(),
                    billing_tags = index.billing_tags.len(),
                    generation,
                    "Billing index rebuilt"
                );
                *self.current.write() = Some(Cached {
                    index: Arc::clone(&index),
                    built_at: Instant::now(),
                    generation,
                });
                Ok(index)
            }
            Err(e) => match self.stale() {
                Some(index) => {
                    tracing::warn!(error = %e, "Billing index rebuild failed, keeping previous copy");
                    Ok(index)
                }
                None => Err(e),
            },
        }
    }

    async fn load(&self) -> Result<BillingIndex, StorageError> {
        let configs = self.store.load_configs().await?;
        let tags = self.store.load_billing_tags().await?;
        Ok(BillingIndex::build(configs, tags))
    }
}
