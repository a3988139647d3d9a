//! The reasoning-engine seam.
//!
//! The fabric core never reasons about message content; it hands inbound
//! messages to whatever [`ReasoningEngine`] the agent was spawned with and
//! routes the reply. LLM-backed engines, tool-running engines, and the test
//! engines below all plug in through the same trait.

use async_trait::async_trait;

use weft_protocol::{Message, MessageMetadata};
use weft_types::{AgentId, MessageKind};

/// Failure inside a reasoning engine. The runtime reports it to the message
/// sender as an ERROR reply and keeps running.
#[derive(Debug, thiserror::Error)]
#[error("engine failure: {0}")]
pub struct EngineError(pub String);

/// A reply produced by an engine.
///
/// Fields the engine leaves unset are filled in by the runtime: the receiver
/// defaults to the inbound sender, the kind to the natural reply kind for
/// the inbound message, and the request id to the inbound correlation id.
#[derive(Debug, Clone, Default)]
pub struct EngineReply {
    /// Reply body.
    pub content: String,
    /// Reply kind override.
    pub kind: Option<MessageKind>,
    /// Receiver override (for delegation to a third agent).
    pub receiver_id: Option<AgentId>,
    /// Metadata to attach; the runtime fills correlation fields it leaves
    /// empty.
    pub metadata: MessageMetadata,
}

impl EngineReply {
    /// A plain reply to the inbound sender.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Pluggable reasoning for one agent.
///
/// Engines are stateless with respect to the hub; whatever conversational
/// state they keep is their own concern. `handle` may take arbitrarily long
/// and is cancelled by dropping its future when the agent stops.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Processes one inbound message, optionally producing a reply.
    async fn handle(&mut self, message: &Message) -> Result<Option<EngineReply>, EngineError>;

    /// Token usage of the most recent `handle` call.
    fn last_token_usage(&self) -> u64;

    /// Releases engine resources on agent stop.
    async fn shutdown(&mut self) {}
}

/// Engine that echoes inbound content. Used in tests and smoke deployments.
pub struct EchoEngine {
    tokens_per_reply: u64,
    last_usage: u64,
}

impl EchoEngine {
    pub fn new(tokens_per_reply: u64) -> Self {
        Self {
            tokens_per_reply,
            last_usage: 0,
        }
    }
}

#[async_trait]
impl ReasoningEngine for EchoEngine {
    async fn handle(&mut self, message: &Message) -> Result<Option<EngineReply>, EngineError> {
        self.last_usage = self.tokens_per_reply;
        Ok(Some(EngineReply::text(format!("echo: {}", message.content))))
    }

    fn last_token_usage(&self) -> u64 {
        self.last_usage
    }
}

/// Engine that always fails. Used to test error reporting.
pub struct FailingEngine;

#[async_trait]
impl ReasoningEngine for FailingEngine {
    async fn handle(&mut self, _message: &Message) -> Result<Option<EngineReply>, EngineError> {
        Err(EngineError("model unavailable".into()))
    }

    fn last_token_usage(&self) -> u64 {
        0
    }
}

/// Engine that stays silent. Used to test timeout paths.
pub struct SilentEngine;

#[async_trait]
impl ReasoningEngine for SilentEngine {
    async fn handle(&mut self, _message: &Message) -> Result<Option<EngineReply>, EngineError> {
        Ok(None)
    }

    fn last_token_usage(&self) -> u64 {
        0
    }
}
