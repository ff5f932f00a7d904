//! Billing Layer
//!
//! Real-time classification of events into billable aggregates and
//! ordinary log entries.
//!
//! # Components
//!
//! - [`BillingRule`] / [`Matcher`]: One administrator-defined rule
//! - [`BillingIndex`]: Rules partitioned by match type plus the billing tag set
//! - [`BillingConfigCache`]: TTL-bounded, explicitly invalidated index holder
//! - [`UnmatchedRing`]: Bounded record of billable events no rule matched
//! - [`BillingEngine`]: The [`BatchProcessor`](crate::ingest::BatchProcessor) behind every receiver

mod engine;
mod index;
mod rule;
mod unmatched;

pub use engine::{BillingEngine, DayZone};
pub use index::{BillingConfigCache, BillingIndex};
pub use rule::{BillingRule, Matcher};
pub use unmatched::{DEFAULT_SNAPSHOT_LIMIT, SAMPLE_MAX_CHARS, UnmatchedItem, UnmatchedRing};
