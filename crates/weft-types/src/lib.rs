//! Shared types and constants for the Weft agent fabric.
//!
//! This crate provides the foundational types used across all Weft crates:
//! agent and interaction classifications, capability descriptors, agent
//! metadata, message kinds, and discovery result shapes.
//!
//! No crate in the workspace depends on anything *except* `weft-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of an agent within a fabric. Unique per hub.
pub type AgentId = String;

/// Classification of a participant in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    /// A human participant (operated through some front-end client).
    #[serde(rename = "HUMAN")]
    Human,
    /// An autonomous AI agent.
    #[serde(rename = "AI")]
    Ai,
}

impl AgentType {
    /// Returns the wire label for this agent type.
    pub fn label(self) -> &'static str {
        match self {
            Self::Human => "HUMAN",
            Self::Ai => "AI",
        }
    }
}

/// Interaction modes an agent supports.
///
/// Routing between two agents requires at least one mode in common.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionMode {
    /// Direct human-to-agent conversation.
    #[serde(rename = "HUMAN_TO_AGENT")]
    HumanToAgent,
    /// Autonomous agent-to-agent collaboration.
    #[serde(rename = "AGENT_TO_AGENT")]
    AgentToAgent,
}

impl InteractionMode {
    /// All defined interaction modes.
    pub const ALL: [InteractionMode; 2] = [Self::HumanToAgent, Self::AgentToAgent];

    /// Returns the wire label for this mode.
    pub fn label(self) -> &'static str {
        match self {
            Self::HumanToAgent => "HUMAN_TO_AGENT",
            Self::AgentToAgent => "AGENT_TO_AGENT",
        }
    }
}

/// Versions of the agent communication protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// The initial protocol version. All messages are emitted at this version.
    #[default]
    #[serde(rename = "1.0")]
    V1_0,
    /// Reserved forward-compatible version; accepted on validation.
    #[serde(rename = "1.1")]
    V1_1,
}

impl ProtocolVersion {
    /// Returns the version string as carried on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
        }
    }
}

/// The kind of a message exchanged between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Free-form text.
    Text,
    /// An instruction the receiver should act on.
    Command,
    /// A reply to an earlier directed request.
    Response,
    /// An error report addressed to the originator of a failed operation.
    Error,
    /// Ends a conversation with the receiver.
    Stop,
    /// Fabric-level announcement; not addressed to a specific conversation.
    System,
    /// Liveness probe. Answered without involving the reasoning engine.
    Ping,
    /// Notifies the receiver that the sender is rate-limited.
    Cooldown,
    /// Asks the receiver to perform a task on behalf of the sender.
    RequestCollaboration,
    /// The result of a collaboration request.
    ResponseCollaboration,
    /// Asks the receiver to enumerate its declared capabilities.
    CapabilityRequest,
    /// The receiver's declared capabilities.
    CapabilityResponse,
}

impl MessageKind {
    /// Returns the wire label for this kind.
    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Command => "COMMAND",
            Self::Response => "RESPONSE",
            Self::Error => "ERROR",
            Self::Stop => "STOP",
            Self::System => "SYSTEM",
            Self::Ping => "PING",
            Self::Cooldown => "COOLDOWN",
            Self::RequestCollaboration => "REQUEST_COLLABORATION",
            Self::ResponseCollaboration => "RESPONSE_COLLABORATION",
            Self::CapabilityRequest => "CAPABILITY_REQUEST",
            Self::CapabilityResponse => "CAPABILITY_RESPONSE",
        }
    }

    /// Whether this kind can close a pending directed request.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Self::Response | Self::ResponseCollaboration | Self::Error
        )
    }
}

/// A named, described unit of functionality an agent advertises.
///
/// The `name` is the stable identifier used for exact discovery; the
/// `description` is the natural-language text used for semantic discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Short stable identifier, e.g. `"summarize"`.
    pub name: String,
    /// Natural-language description of what the capability does.
    pub description: String,
    /// Schema of the expected input, if declared.
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Schema of the produced output, if declared.
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Free-form descriptors such as cost hints. Opaque to the fabric.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Capability {
    /// Creates a capability with just a name and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: None,
            output_schema: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Descriptive metadata an agent registers with the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique identifier of the agent within the hub.
    #[serde(rename = "agentId")]
    pub agent_id: AgentId,
    /// Whether the agent is a human participant or an AI.
    #[serde(rename = "agentType")]
    pub agent_type: AgentType,
    /// Interaction modes the agent supports.
    #[serde(rename = "interactionModes")]
    pub interaction_modes: Vec<InteractionMode>,
    /// Capabilities the agent advertises for discovery.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Organization the agent belongs to, if any.
    #[serde(rename = "organizationId", skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Opaque wallet address for receiving payments. Stored and surfaced in
    /// discovery results; never interpreted by the fabric.
    #[serde(rename = "paymentAddress", skip_serializing_if = "Option::is_none")]
    pub payment_address: Option<String>,
    /// Free-form extra metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, Value>,
}

impl AgentProfile {
    /// Creates a minimal AI profile supporting agent-to-agent interaction.
    pub fn ai(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: AgentType::Ai,
            interaction_modes: vec![InteractionMode::AgentToAgent],
            capabilities: Vec::new(),
            organization_id: None,
            payment_address: None,
            custom: BTreeMap::new(),
        }
    }

    /// Creates a minimal human profile.
    pub fn human(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: AgentType::Human,
            interaction_modes: vec![InteractionMode::HumanToAgent],
            capabilities: Vec::new(),
            organization_id: None,
            payment_address: None,
            custom: BTreeMap::new(),
        }
    }

    /// Adds a capability and returns the profile, builder-style.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Sets the payment address and returns the profile, builder-style.
    pub fn with_payment_address(mut self, address: impl Into<String>) -> Self {
        self.payment_address = Some(address.into());
        self
    }

    /// Sets the organization and returns the profile, builder-style.
    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }
}

/// One entry in a discovery result set.
///
/// `score` is present only for semantic queries and is normalized to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredAgent {
    /// The discovered agent's identifier.
    #[serde(rename = "agentId")]
    pub agent_id: AgentId,
    /// Organization membership, if any.
    #[serde(rename = "organizationId", skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Agent classification.
    #[serde(rename = "agentType")]
    pub agent_type: AgentType,
    /// Capabilities the agent advertises.
    pub capabilities: Vec<Capability>,
    /// Opaque payment address, if the agent attached one.
    #[serde(rename = "paymentAddress", skip_serializing_if = "Option::is_none")]
    pub payment_address: Option<String>,
    /// Normalized similarity score for semantic queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}
