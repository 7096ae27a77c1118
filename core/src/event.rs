//! The [`Event`] trait binding a payload type to its subject.
//!
//! This is the compile-time half of the channel registry. Each payload type
//! names exactly one [`Subject`] through an associated constant, so a
//! `Publisher<TicketUpdated>` can only publish on `ticket:updated` and a
//! listener whose `Event` is `TicketUpdated` only ever receives that payload.
//!
//! # Wire format
//!
//! Payloads travel as JSON with camelCase field names. Services written in
//! other languages share the same subjects, so a self-describing text format
//! is used rather than a Rust-only binary encoding.
//!
//! # Example
//!
//! ```
//! use ticketbus_core::event::Event;
//! use ticketbus_core::subject::Subject;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct Ping {
//!     message: String,
//! }
//!
//! impl Event for Ping {
//!     const SUBJECT: Subject = Subject::StreamHealthPing;
//! }
//!
//! let bytes = Ping { message: "hi".into() }.encode().unwrap();
//! assert_eq!(Ping::decode(&bytes).unwrap().message, "hi");
//! ```

use crate::entity::Version;
use crate::subject::Subject;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Error types for payload encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize a payload.
    #[error("Failed to serialize {subject} payload: {reason}")]
    Serialization {
        /// Subject of the payload
        subject: Subject,
        /// Underlying serializer message
        reason: String,
    },

    /// Bytes received on a subject do not match its payload schema.
    #[error("Failed to decode {subject} payload: {reason}")]
    Deserialization {
        /// Subject the bytes arrived on
        subject: Subject,
        /// Underlying deserializer message
        reason: String,
    },
}

/// A payload bound to exactly one subject.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The subject this payload is published on.
    const SUBJECT: Subject;

    /// Version of the entity this payload describes, if it describes one.
    ///
    /// Only used for logging; the version guard reads the typed fields.
    fn entity_version(&self) -> Option<Version> {
        None
    }

    /// Encode the payload into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be
    /// represented as JSON (for example a map with non-string keys).
    fn encode(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Serialization {
            subject: Self::SUBJECT,
            reason: e.to_string(),
        })
    }

    /// Decode a payload from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the bytes are not a valid
    /// payload for [`Self::SUBJECT`].
    fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Deserialization {
            subject: Self::SUBJECT,
            reason: e.to_string(),
        })
    }
}
