//! Billing rule model.

use std::collections::HashSet;

use crate::ingest::RawEvent;
use crate::storage::{BillingConfigRecord, MatchType, split_tags};

/// What a rule compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// An in-scope event tag equals or contains the value.
    Tag(String),
    /// The event's rule name contains the value.
    RuleName(String),
    /// The event's log line contains the value.
    LogLineContains(String),
}

impl Matcher {
    pub fn new(match_type: MatchType, value: impl Into<String>) -> Self {
        let value = value.into();
        match match_type {
            MatchType::Tag => Self::Tag(value),
            MatchType::RuleName => Self::RuleName(value),
            MatchType::LogLineContains => Self::LogLineContains(value),
        }
    }

    pub fn match_type(&self) -> MatchType {
        match self {
            Self::Tag(_) => MatchType::Tag,
            Self::RuleName(_) => MatchType::RuleName,
            Self::LogLineContains(_) => MatchType::LogLineContains,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Tag(v) | Self::RuleName(v) | Self::LogLineContains(v) => v,
        }
    }
}

/// A billing rule ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingRule {
    pub id: i64,
    pub bill_key: String,
    /// Billing tags the rule is scoped to.
    pub scope: HashSet<String>,
    pub matcher: Matcher,
    pub unit_price: f64,
}

impl From<BillingConfigRecord> for BillingRule {
    fn from(record: BillingConfigRecord) -> Self {
        Self {
            id: record.id,
            scope: split_tags(&record.billing_tag).map(str::to_string).collect(),
            matcher: Matcher::new(record.match_type, record.match_value),
            bill_key: record.bill_key,
            unit_price: record.unit_price,
        }
    }
}

impl BillingRule {
    /// Whether any of `tags` falls inside the rule's scope.
    pub fn in_scope(&self, tags: &[&str]) -> bool {
        tags.iter().any(|t| self.scope.contains(*t))
    }

    /// Evaluate the rule against an event whose split tags are `tags`.
    pub fn matches(&self, event: &RawEvent, tags: &[&str]) -> bool {
        match &self.matcher {
            Matcher::Tag(value) => tags
                .iter()
                .any(|t| self.scope.contains(*t) && t.contains(value.as_str())),
            Matcher::RuleName(value) => {
                self.in_scope(tags) && event.rule_name.contains(value.as_str())
            }
            Matcher::LogLineContains(value) => {
                self.in_scope(tags) && event.log_line.contains(value.as_str())
            }
        }
    }
}
