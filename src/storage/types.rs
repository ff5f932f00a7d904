//! Core data types for the storage layer.
//!
//! - [`NewLogEntry`]: a non-billable event ready for insertion
//! - [`BillingDelta`]: an additive increment to one daily billing aggregate
//! - [`FlushBatch`]: every durable side effect of one consumer flush
//! - [`BillingConfigRecord`] / [`MatchType`]: administrator-defined billing rules
//! - [`TagProject`] / [`ProjectType`]: tag grouping, including the billing project
//! - [`MetricsRecord`]: an agent metric report

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Source value written for events that arrived from agents.
pub const AGENT_SOURCE: &str = "agent";

/// Split a comma-joined tag field into trimmed, non-empty tags.
///
/// ```
/// use logbill::storage::split_tags;
///
/// let tags: Vec<&str> = split_tags(" a, b,,c ").collect();
/// assert_eq!(tags, vec!["a", "b", "c"]);
/// ```
pub fn split_tags(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// A log entry to be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    /// Event time (unix seconds).
    pub timestamp: i64,
    pub rule_name: String,
    pub rule_desc: String,
    pub log_line: String,
    pub log_file: String,
    pub pattern: String,
    /// Comma-joined tag list as received.
    pub tag: String,
    /// Origin of the row, [`AGENT_SOURCE`] for ingested events.
    pub source: String,
}

/// Additive increment for the aggregate keyed by `(date, bill_key, tag)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingDelta {
    /// Calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub bill_key: String,
    pub tag: String,
    pub count: i64,
    pub amount: f64,
}

/// Every durable side effect of one flush, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct FlushBatch {
    /// Billing aggregate increments, at most one per key.
    pub billing: Vec<BillingDelta>,
    /// Non-billable events.
    pub logs: Vec<NewLogEntry>,
    /// Per-tag increments of the live log count.
    pub tag_deltas: BTreeMap<String, i64>,
}

impl FlushBatch {
    /// True when the flush would not write anything.
    pub fn is_empty(&self) -> bool {
        self.billing.is_empty() && self.logs.is_empty() && self.tag_deltas.is_empty()
    }
}

/// How a billing rule compares against an event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum MatchType {
    /// One of the event's tags equals or contains the match value.
    Tag,
    /// The event's rule name contains the match value.
    RuleName,
    /// The event's log line contains the match value.
    LogLineContains,
}

/// A billing rule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingConfigRecord {
    pub id: i64,
    pub bill_key: String,
    /// Comma-joined set of billing tags this rule is scoped to.
    pub billing_tag: String,
    pub match_type: MatchType,
    pub match_value: String,
    pub unit_price: f64,
    #[serde(default)]
    pub description: String,
}

/// A billing rule to be created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBillingConfig {
    pub bill_key: String,
    pub billing_tag: String,
    pub match_type: MatchType,
    pub match_value: String,
    pub unit_price: f64,
    #[serde(default)]
    pub description: String,
}

/// Tag project classification.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProjectType {
    /// Ordinary grouping of tags.
    #[default]
    Normal,
    /// The single project whose tags are evaluated against billing rules.
    Billing,
}

/// A tag project row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagProject {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    pub description: String,
}

/// An aggregated agent metric report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// Report time (unix seconds).
    pub timestamp: i64,
    /// Hit count per rule name.
    pub rule_counts: BTreeMap<String, i64>,
    pub total_count: i64,
    /// Length of the reporting window in seconds.
    pub duration: i64,
    #[serde(default)]
    pub tag: String,
}
