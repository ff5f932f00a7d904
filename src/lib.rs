//! Logbill - log and metric ingestion with billing classification
//!
//! Agents push log events over a length-prefixed TCP stream, UDP datagrams
//! or HTTP. Every accepted batch is classified: events carrying a billing
//! tag are folded into per-day billing aggregates, everything else is stored
//! as an ordinary log entry.
//!
//! # Architecture
//!
//! - **Ingest**: TCP and UDP listeners feeding bounded queues drained by batch consumers
//! - **Billing**: TTL-cached rule index, classification engine and unmatched ring
//! - **Registry**: Write-once caches of every tag and rule name seen
//! - **Storage**: SQLite persistence with one transaction per flushed batch
//! - **Retention**: Daily paged expiry of logs and metric reports
//! - **Server**: HTTP ingestion, rule administration and health probes
//!
//! # Example
//!
//! ```rust,ignore
//! use logbill::{BillingConfigCache, BillingEngine, Registry, StorageBuilder, UnmatchedRing};
//!
//! let handles = StorageBuilder::from_path("data/logbill.db").build().await?;
//! let cache = Arc::new(BillingConfigCache::new(handles.billing.clone(), Duration::from_secs(60)));
//! let engine = BillingEngine::new(
//!     handles.ingest.clone(),
//!     cache,
//!     Registry::tags(handles.registry.clone()),
//!     Registry::rule_names(handles.registry.clone()),
//!     Arc::new(UnmatchedRing::new(5000)),
//! );
//! let outcome = engine.process_batch(events).await?;
//! ```

pub mod billing;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod ratelimit;
pub mod registry;
pub mod retention;
pub mod server;
pub mod storage;

pub use billing::{BillingConfigCache, BillingEngine, DayZone, UnmatchedRing};
pub use config::AppConfig;
pub use ingest::{
    BatchConsumer, BatchOutcome, BatchProcessor, IngestError, RawEvent, SharedSecret,
    TcpListenerTask, Transport, UdpListenerTask,
};
pub use ratelimit::DualRateLimiter;
pub use registry::Registry;
pub use retention::RetentionSweeper;
pub use storage::{StorageBuilder, StorageError, StorageHandles};
