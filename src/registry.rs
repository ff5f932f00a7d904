//! Tag and rule name registries.
//!
//! Write-through existence caches over the `tags` and `rule_names` tables.
//! Lookups are served from memory; a miss performs an idempotent insert and
//! then records the name locally. No lock is held across a storage call.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::{BackfillSource, RegistryKind, RegistryStore, StorageError, split_tags};

/// Rows read per backfill page.
pub const BACKFILL_PAGE_SIZE: i64 = 5_000;

/// In-memory mirror of one reference table.
#[derive(Clone)]
pub struct Registry {
    kind: RegistryKind,
    store: RegistryStore,
    names: Arc<RwLock<HashSet<String>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Registry over the `tags` table.
    pub fn tags(store: RegistryStore) -> Self {
        Self::new(RegistryKind::Tag, store)
    }

    /// Registry over the `rule_names` table.
    pub fn rule_names(store: RegistryStore) -> Self {
        Self::new(RegistryKind::RuleName, store)
    }

    fn new(kind: RegistryKind, store: RegistryStore) -> Self {
        Self {
            kind,
            store,
            names: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    /// Replace the in-memory set with the table contents.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let names: HashSet<String> = self.store.list(self.kind).await?.into_iter().collect();
        let len = names.len();
        *self.names.write() = names;
        tracing::debug!(kind = self.kind.label(), count = len, "Registry loaded");
        Ok(len)
    }

    /// Make sure `name` is registered.
    ///
    /// Returns true when this call added it to the in-memory set.
    pub async fn ensure(&self, name: &str) -> Result<bool, StorageError> {
        let name = name.trim();
        if name.is_empty() || self.names.read().contains(name) {
            return Ok(false);
        }

        // Idempotent, so racing callers may both reach it safely.
        self.store.insert(self.kind, name).await?;

        Ok(self.names.write().insert(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Seed an empty registry from historical rows.
    ///
    /// Runs only when the table has no rows. Sources are scanned in keyset
    /// pages of [`BACKFILL_PAGE_SIZE`] and each page's new names are inserted
    /// before the next page is read. Returns the number of names added.
    pub async fn backfill(&self) -> Result<usize, StorageError> {
        if self.store.count(self.kind).await? > 0 {
            return Ok(0);
        }

        let mut added = 0;
        for &source in self.kind.backfill_sources() {
            let mut after_id = 0;
            loop {
                let page = self
                    .store
                    .scan_page(source, after_id, BACKFILL_PAGE_SIZE)
                    .await?;
                let Some(&(last_id, _)) = page.last() else {
                    break;
                };
                after_id = last_id;

                let fresh = self.unseen_in_page(source, &page);
                if !fresh.is_empty() {
                    self.store.insert_many(self.kind, &fresh).await?;
                    added += fresh.len();
                    self.names.write().extend(fresh);
                }

                if (page.len() as i64) < BACKFILL_PAGE_SIZE {
                    break;
                }
            }
        }

        if added > 0 {
            tracing::info!(kind = self.kind.label(), added, "Registry backfilled");
        }
        Ok(added)
    }

    fn unseen_in_page(&self, source: BackfillSource, page: &[(i64, String)]) -> Vec<String> {
        let known = self.names.read();
        let mut fresh: HashSet<&str> = HashSet::new();
        for (_, value) in page {
            if source.is_tag_list() {
                fresh.extend(split_tags(value).filter(|t| !known.contains(*t)));
            } else {
                let v = value.trim();
                if !v.is_empty() && !known.contains(v) {
                    fresh.insert(v);
                }
            }
        }
        fresh.into_iter().map(str::to_string).collect()
    }
}

/// Seed `tag_log_counts` from live log entries when it is empty.
///
/// Returns the number of tags written.
pub async fn backfill_tag_log_counts(store: &RegistryStore) -> Result<usize, StorageError> {
    if !store.tag_log_counts_empty().await? {
        return Ok(0);
    }

    let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
    let mut after_id = 0;
    loop {
        let page = store
            .scan_page(BackfillSource::LogTags, after_id, BACKFILL_PAGE_SIZE)
            .await?;
        let Some(&(last_id, _)) = page.last() else {
            break;
        };
        after_id = last_id;
        for (_, tag) in &page {
            for t in split_tags(tag) {
                *deltas.entry(t.to_string()).or_default() += 1;
            }
        }
        if (page.len() as i64) < BACKFILL_PAGE_SIZE {
            break;
        }
    }

    store.apply_tag_deltas(&deltas).await?;
    if !deltas.is_empty() {
        tracing::info!(tags = deltas.len(), "Tag log counts backfilled");
    }
    Ok(deltas.len())
}
