//! Message model and the in-process message log.
//!
//! Messages are append-only and carry ISO-8601 timestamps that compare
//! correctly as strings, so cursors are plain string comparisons. The
//! transport pushes messages in via [`MessageLog::append`]; the dispatch
//! loop reads them back with fetch-after queries.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A single inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub group_id: String,
    pub sender: String,
    pub content: String,
    /// ISO-8601 UTC timestamp. String comparison == chronological comparison.
    pub timestamp: String,
    /// True for messages we sent ourselves — recorded, never dispatched.
    #[serde(default)]
    pub from_self: bool,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            sender: sender.into(),
            content: content.into(),
            timestamp: timestamp.into(),
            from_self: false,
        }
    }
}

/// Format a `DateTime` the way message timestamps are stored.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Append-only, timestamp-ordered message log shared between the transport
/// and the dispatch loop.
///
/// The log is the in-process stand-in for the transport's message store:
/// `fetch_all_after` drives the global intake cursor, `fetch_group_after`
/// rebuilds a group's backlog from its agent cursor.
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Mutex<Vec<Message>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append messages, keeping the log sorted by timestamp.
    ///
    /// Out-of-order arrivals (transport retries, multi-device echo) are
    /// inserted at the right position rather than rejected.
    pub fn append(&self, incoming: Vec<Message>) {
        if incoming.is_empty() {
            return;
        }
        let mut messages = self.messages.lock().unwrap();
        messages.extend(incoming);
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    /// All peer messages with a timestamp strictly greater than `after`,
    /// across every group, in timestamp order. Pass `""` for everything.
    pub fn fetch_all_after(&self, after: &str) -> Vec<Message> {
        let messages = self.messages.lock().unwrap();
        messages
            .iter()
            .filter(|m| !m.from_self && m.timestamp.as_str() > after)
            .cloned()
            .collect()
    }

    /// Peer messages for one group with a timestamp strictly greater than
    /// `after`, in timestamp order.
    pub fn fetch_group_after(&self, group_id: &str, after: &str) -> Vec<Message> {
        let messages = self.messages.lock().unwrap();
        messages
            .iter()
            .filter(|m| !m.from_self && m.group_id == group_id && m.timestamp.as_str() > after)
            .cloned()
            .collect()
    }

    /// Timestamp of the newest message in the log, if any.
    pub fn latest_timestamp(&self) -> Option<String> {
        let messages = self.messages.lock().unwrap();
        messages.last().map(|m| m.timestamp.clone())
    }
}
