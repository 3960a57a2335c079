//! # relay-protocol
//!
//! Wire protocol definitions for the Relay chat server.
//!
//! Every frame on the wire is a JSON text message. Clients send bare
//! [`InboundMessage`] objects; the server answers with tagged [`Envelope`]s.
//!
//! ## Envelopes
//!
//! - `history` - sent once per connection, right after the upgrade
//! - `message` - a live chat message, fanned out to every connection
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Envelope, MessageData};
//!
//! let inbound = codec::decode_inbound(r#"{"username":"alice","text":"hi"}"#).unwrap();
//! assert_eq!(inbound.text, "hi");
//!
//! let envelope = Envelope::message(MessageData::new("alice", "hi", "2024-05-01T12:00:00.000000Z"));
//! let json = codec::encode(&envelope).unwrap();
//! assert!(json.starts_with(r#"{"type":"message""#));
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{
    decode, decode_inbound, decode_inbound_with_limit, encode, ProtocolError, MAX_INBOUND_SIZE,
};
pub use envelope::{Envelope, EnvelopeType, InboundMessage, MessageData};
