//! The message envelope and its canonical signable form.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use weft_identity::AgentIdentity;
use weft_types::{AgentId, MessageKind, ProtocolVersion};

use crate::ProtocolError;

/// Typed metadata attached to a message.
///
/// Known correlation fields are first-class; anything else an agent attaches
/// rides along in `custom` and is preserved verbatim through signing and
/// routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Correlation id linking a directed request to its response.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Ordered list of agent ids already on the call stack of this request.
    /// Maintained exclusively by the hub.
    #[serde(rename = "collaborationChain", skip_serializing_if = "Option::is_none")]
    pub collaboration_chain: Option<Vec<AgentId>>,

    /// Capability name a collaboration request is invoking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,

    /// Opaque payment address the sender wants the receiver to see.
    #[serde(rename = "paymentAddress", skip_serializing_if = "Option::is_none")]
    pub payment_address: Option<String>,

    /// Free-form extension fields.
    #[serde(flatten)]
    pub custom: BTreeMap<String, Value>,
}

impl MessageMetadata {
    /// Metadata carrying only a request correlation id.
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    /// Whether no fields are set at all.
    pub fn is_empty(&self) -> bool {
        self.request_id.is_none()
            && self.collaboration_chain.is_none()
            && self.capability.is_none()
            && self.payment_address.is_none()
            && self.custom.is_empty()
    }
}

/// A signed message exchanged between agents.
///
/// Messages are immutable once routed. The only party that ever rewrites one
/// is the hub, which appends the sender to the collaboration chain of a
/// `REQUEST_COLLABORATION` after the signature has been checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: Uuid,
    /// Sending agent.
    #[serde(rename = "senderId")]
    pub sender_id: AgentId,
    /// Receiving agent.
    #[serde(rename = "receiverId")]
    pub receiver_id: AgentId,
    /// Message body.
    pub content: String,
    /// Message kind.
    #[serde(rename = "messageType")]
    pub kind: MessageKind,
    /// Protocol version the sender speaks.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: ProtocolVersion,
    /// Creation time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Correlation and extension metadata.
    #[serde(default)]
    pub metadata: MessageMetadata,
    /// Base64-encoded Ed25519 signature over the canonical signable form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    /// Builds an unsigned message with a fresh id and the current timestamp.
    pub fn build(
        sender_id: impl Into<AgentId>,
        receiver_id: impl Into<AgentId>,
        content: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            content: content.into(),
            kind,
            protocol_version: ProtocolVersion::V1_0,
            timestamp: Utc::now(),
            metadata: MessageMetadata::default(),
            signature: None,
        }
    }

    /// Attaches metadata, builder-style.
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builds and signs a message in one step.
    pub fn signed(
        sender_id: impl Into<AgentId>,
        receiver_id: impl Into<AgentId>,
        content: impl Into<String>,
        kind: MessageKind,
        metadata: MessageMetadata,
        identity: &AgentIdentity,
    ) -> Result<Self, ProtocolError> {
        let mut message = Self::build(sender_id, receiver_id, content, kind).with_metadata(metadata);
        message.sign_with(identity)?;
        Ok(message)
    }

    /// The canonical signable serialization of this message.
    ///
    /// Keys are sorted lexicographically (`serde_json`'s object map is
    /// ordered) and encoded as compact UTF-8 JSON. The `id` and `signature`
    /// fields are not part of the signed envelope.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut object = serde_json::Map::new();
        object.insert("senderId".into(), Value::String(self.sender_id.clone()));
        object.insert("receiverId".into(), Value::String(self.receiver_id.clone()));
        object.insert("content".into(), Value::String(self.content.clone()));
        object.insert("messageType".into(), serde_json::to_value(self.kind)?);
        object.insert(
            "protocolVersion".into(),
            serde_json::to_value(self.protocol_version)?,
        );
        object.insert("timestamp".into(), serde_json::to_value(self.timestamp)?);
        object.insert("metadata".into(), serde_json::to_value(&self.metadata)?);
        Ok(serde_json::to_vec(&Value::Object(object))?)
    }

    /// Signs the message with the sender's identity, replacing any existing
    /// signature.
    pub fn sign_with(&mut self, identity: &AgentIdentity) -> Result<(), ProtocolError> {
        let payload = self.signable_bytes()?;
        let signature = identity.sign(&payload)?;
        self.signature = Some(BASE64.encode(signature.to_bytes()));
        Ok(())
    }

    /// Verifies the signature against the given identity's public key.
    ///
    /// Unsigned messages and malformed signatures verify as `false`.
    pub fn verify_with(&self, identity: &AgentIdentity) -> bool {
        let Some(encoded) = &self.signature else {
            return false;
        };
        let Ok(bytes) = BASE64.decode(encoded) else {
            return false;
        };
        let Ok(arr) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&arr);
        match self.signable_bytes() {
            Ok(payload) => identity.verify(&payload, &signature),
            Err(_) => false,
        }
    }

    /// The conversation this message belongs to, from the receiver's side.
    ///
    /// Conversations are keyed by the peer: all traffic with one partner is
    /// one conversation for turn accounting.
    pub fn conversation_id(&self) -> &str {
        &self.sender_id
    }
}
