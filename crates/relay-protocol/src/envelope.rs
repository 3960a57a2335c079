//! Envelope types for the Relay protocol.
//!
//! Inbound frames are plain `{ "username", "text" }` objects. Outbound frames
//! are adjacently tagged: `{ "type": ..., "data": ... }`.
//!
//! Note the rename: the client's `text` becomes `message` in everything the
//! server emits or stores. Browser clients depend on it.

use serde::{Deserialize, Serialize};

/// Envelope type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    History,
    Message,
}

impl EnvelopeType {
    /// The tag as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::History => "history",
            EnvelopeType::Message => "message",
        }
    }
}

/// A chat message sent by a client.
///
/// Unknown fields are rejected, so a typo in a client surfaces as a
/// validation error instead of a silently empty message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundMessage {
    /// Author name. Untrusted, must not be empty.
    pub username: String,
    /// Message body. Untrusted, may be empty.
    pub text: String,
}

impl InboundMessage {
    /// Create a new inbound message.
    #[must_use]
    pub fn new(username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            text: text.into(),
        }
    }
}

/// A chat message as the server presents it, in history and live envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageData {
    /// Author name.
    pub username: String,
    /// Message body (the inbound `text`).
    pub message: String,
    /// RFC 3339 timestamp assigned by the server.
    pub timestamp: String,
}

impl MessageData {
    /// Create a new message payload.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        message: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            message: message.into(),
            timestamp: timestamp.into(),
        }
    }
}

/// A server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    /// Recent messages, oldest first. Sent exactly once per connection.
    History(Vec<MessageData>),

    /// A single live message.
    Message(MessageData),
}

impl Envelope {
    /// Get the envelope type.
    #[must_use]
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            Envelope::History(_) => EnvelopeType::History,
            Envelope::Message(_) => EnvelopeType::Message,
        }
    }

    /// Create a new History envelope.
    #[must_use]
    pub fn history(messages: Vec<MessageData>) -> Self {
        Envelope::History(messages)
    }

    /// Create a new Message envelope.
    #[must_use]
    pub fn message(data: MessageData) -> Self {
        Envelope::Message(data)
    }
}
