//! Chat message types for Relay.
//!
//! A [`ChatMessage`] is built once per accepted inbound frame and never
//! mutated afterwards. Its timestamp comes from a [`MonotonicClock`], so
//! successive messages accepted by one process never go backwards in time.

use chrono::{DateTime, SecondsFormat, Utc};
use relay_protocol::{Envelope, InboundMessage, MessageData};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Format a timestamp the way it appears on the wire and in the store.
#[must_use]
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously produced by [`format_timestamp`].
#[must_use]
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Process-wide clock that never goes backwards.
///
/// Wall-clock readings are truncated to microseconds, the wire precision.
/// A reading older than the last one handed out is replaced by the last one.
#[derive(Debug)]
pub struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    /// Create a new clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    /// Get the current time.
    pub fn now(&self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    /// Fold a wall-clock reading into the clock and return the adjusted time.
    pub fn observe(&self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let micros = wall.timestamp_micros();
        let previous = self.last_micros.fetch_max(micros, Ordering::AcqRel);
        DateTime::from_timestamp_micros(previous.max(micros)).unwrap_or(wall)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A chat message accepted by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Author name.
    pub username: String,
    /// Message body (the inbound `text`).
    pub body: String,
    /// Server-assigned receipt time.
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            body: body.into(),
            timestamp,
        }
    }

    /// Build a message from a validated client frame.
    #[must_use]
    pub fn from_inbound(inbound: InboundMessage, timestamp: DateTime<Utc>) -> Self {
        Self {
            username: inbound.username,
            body: inbound.text,
            timestamp,
        }
    }

    /// The wire representation of this message.
    #[must_use]
    pub fn to_data(&self) -> MessageData {
        MessageData::new(
            self.username.as_str(),
            self.body.as_str(),
            format_timestamp(&self.timestamp),
        )
    }

    /// Wrap this message in a live `message` envelope.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::message(self.to_data())
    }
}

/// Store-assigned message identifier. Never sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message together with its store identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Store identifier.
    pub id: RecordId,
    /// The message itself.
    pub message: ChatMessage,
}
