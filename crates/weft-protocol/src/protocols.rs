//! Protocol validators applied before routing.

use weft_types::MessageKind;

use crate::{Message, ProtocolError};

/// A validation pass over a message envelope.
///
/// Protocols never mutate messages and never synthesize content; they only
/// accept or reject.
pub trait Protocol: Send + Sync {
    /// Validates the message, returning the first violation found.
    fn validate(&self, message: &Message) -> Result<(), ProtocolError>;
}

/// Baseline peer-to-peer protocol: envelope sanity and signature presence.
///
/// Signature *correctness* is the hub's job (it owns the sender's registered
/// identity); this validator only guarantees the field is there.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimplePeerProtocol;

impl SimplePeerProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for SimplePeerProtocol {
    fn validate(&self, message: &Message) -> Result<(), ProtocolError> {
        if message.sender_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty senderId".into()));
        }
        if message.receiver_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty receiverId".into()));
        }
        if message.sender_id == message.receiver_id {
            return Err(ProtocolError::SelfAddressed(message.sender_id.clone()));
        }
        if message.signature.is_none() {
            return Err(ProtocolError::Unsigned(message.id));
        }
        Ok(())
    }
}

/// Collaboration protocol: peer rules plus request/response correlation.
///
/// `REQUEST_COLLABORATION` must carry a request id and name the capability it
/// is invoking; `RESPONSE_COLLABORATION` must echo the request id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollaborationProtocol {
    peer: SimplePeerProtocol,
}

impl CollaborationProtocol {
    pub fn new() -> Self {
        Self {
            peer: SimplePeerProtocol::new(),
        }
    }
}

impl Protocol for CollaborationProtocol {
    fn validate(&self, message: &Message) -> Result<(), ProtocolError> {
        self.peer.validate(message)?;

        match message.kind {
            MessageKind::RequestCollaboration => {
                if message.metadata.request_id.is_none() {
                    return Err(ProtocolError::MissingRequestId(message.kind));
                }
                if message
                    .metadata
                    .capability
                    .as_deref()
                    .map_or(true, str::is_empty)
                {
                    return Err(ProtocolError::MissingCapability);
                }
            }
            MessageKind::ResponseCollaboration => {
                if message.metadata.request_id.is_none() {
                    return Err(ProtocolError::MissingRequestId(message.kind));
                }
            }
            _ => {}
        }
        Ok(())
    }
}
