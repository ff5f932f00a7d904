//! The agent event shape shared by every transport.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::storage::{AGENT_SOURCE, NewLogEntry, split_tags};

/// Receiver an event arrived through. Set locally, never read from the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    Tcp,
    Udp,
}

/// One event reported by a monitoring agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event time (unix seconds). Zero means missing.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub rule_desc: String,
    #[serde(default)]
    pub log_line: String,
    #[serde(default)]
    pub log_file: String,
    #[serde(default)]
    pub pattern: String,
    /// Comma-joined tag list.
    #[serde(default)]
    pub tag: String,
    /// Shared secret presented by the agent.
    #[serde(default, skip_serializing)]
    pub secret: String,
    /// Alternate field name for [`RawEvent::secret`].
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(skip)]
    pub transport: Transport,
}

impl RawEvent {
    /// Minimal validation: non-zero timestamp and non-empty log line.
    pub fn is_valid(&self) -> bool {
        self.timestamp != 0 && !self.log_line.is_empty()
    }

    /// The secret the agent presented, `secret` taking precedence over `api_key`.
    pub fn presented_secret(&self) -> &str {
        if self.secret.is_empty() {
            &self.api_key
        } else {
            &self.secret
        }
    }

    /// Individual tags, trimmed, empties dropped.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        split_tags(&self.tag)
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Row for a non-billable event.
    pub fn into_log_entry(self) -> NewLogEntry {
        NewLogEntry {
            timestamp: self.timestamp,
            rule_name: self.rule_name,
            rule_desc: self.rule_desc,
            log_line: self.log_line,
            log_file: self.log_file,
            pattern: self.pattern,
            tag: self.tag,
            source: AGENT_SOURCE.to_string(),
        }
    }
}

/// Optional shared secret a listener requires.
#[derive(Clone, Default)]
pub struct SharedSecret(Option<String>);

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedSecret")
            .field(&self.0.as_ref().map(|_| "***"))
            .finish()
    }
}

impl SharedSecret {
    /// An empty secret disables the check.
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            Self(None)
        } else {
            Self(Some(secret.to_string()))
        }
    }

    pub fn is_required(&self) -> bool {
        self.0.is_some()
    }

    /// Whether `event` carries the expected secret.
    pub fn admits(&self, event: &RawEvent) -> bool {
        match &self.0 {
            None => true,
            Some(expected) => event.presented_secret() == expected,
        }
    }
}
