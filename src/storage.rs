//! Storage Layer
//!
//! SQLite persistence through a shared sqlx pool. The pipeline only needs a
//! few primitives: transactional batch insert, upsert with additive update,
//! paged select/delete and simple lookups.
//!
//! # Components
//!
//! - [`IngestStore`]: Atomic flush commit for classified batches
//! - [`RegistryStore`]: Tag / rule name reference tables and backfill scans
//! - [`BillingStore`]: Billing rules and tag projects
//! - [`RetentionStore`]: Paged deletion of expired rows
//! - [`MetricsStore`]: Metric report persistence
//! - [`StorageBuilder`] / [`StorageHandles`]: Initialization and lifecycle management

mod billing_store;
mod builder;
pub mod db;
mod error;
mod facades;
mod schema;
mod types;

pub use billing_store::{BillingStore, DEFAULT_BILLING_PROJECT};
pub use builder::{StorageBuilder, StorageHandles};
pub use error::StorageError;
pub use facades::{
    BackfillSource, BillingTotals, IngestStore, MetricsStore, RegistryKind, RegistryStore,
    RetentionStore,
};
pub use types::{
    AGENT_SOURCE, BillingConfigRecord, BillingDelta, FlushBatch, MatchType, MetricsRecord,
    NewBillingConfig, NewLogEntry, ProjectType, TagProject, split_tags,
};
