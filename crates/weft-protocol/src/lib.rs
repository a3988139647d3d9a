//! Message envelope and protocol layer for the Weft fabric.
//!
//! Defines the canonical [`Message`] structure exchanged between agents, the
//! deterministic signable serialization backing message signatures, and the
//! protocol validators applied by the hub before routing.
//!
//! # Signing rules
//!
//! A signature covers the key-sorted JSON object of
//! `{senderId, receiverId, content, messageType, protocolVersion, timestamp,
//! metadata}`, excluding the `signature` field and the message id. The
//! canonical form is re-derived on verification, so formatting differences
//! can never affect validity.

mod message;
mod protocols;

pub use message::{Message, MessageMetadata};
pub use protocols::{CollaborationProtocol, Protocol, SimplePeerProtocol};

use weft_types::MessageKind;

/// Errors raised by message construction and protocol validation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Signing was attempted with an identity lacking a private key, or the
    /// key material was otherwise unusable.
    #[error(transparent)]
    Identity(#[from] weft_identity::IdentityError),

    /// Canonical serialization of the signable form failed.
    #[error("canonical serialization failed: {0}")]
    Canonical(#[from] serde_json::Error),

    /// A message failed envelope-level validation.
    #[error("invalid message envelope: {0}")]
    InvalidEnvelope(String),

    /// The message is addressed to its own sender.
    #[error("message from {0} is addressed to itself")]
    SelfAddressed(String),

    /// The message carries no signature.
    #[error("message {0} is unsigned")]
    Unsigned(uuid::Uuid),

    /// A collaboration message is missing its request correlation id.
    #[error("{} message requires a requestId", .0.label())]
    MissingRequestId(MessageKind),

    /// A collaboration request names no capability.
    #[error("REQUEST_COLLABORATION message requires a capability name")]
    MissingCapability,
}
