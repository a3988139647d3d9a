//! Shared helpers for hub integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use weft_hub::{AgentMailbox, Hub, HubConfig};
use weft_identity::AgentIdentity;
use weft_observe::NoopSink;
use weft_protocol::{Message, MessageMetadata};
use weft_registry::{AgentRegistration, Registry};
use weft_types::{AgentProfile, Capability, MessageKind};

/// A test-side agent: identity plus its hub mailbox.
pub struct TestAgent {
    pub id: String,
    pub identity: AgentIdentity,
    pub mailbox: AgentMailbox,
}

impl TestAgent {
    /// Builds a signed message from this agent.
    pub fn message(&self, receiver: &str, content: &str, kind: MessageKind) -> Message {
        self.message_with(receiver, content, kind, MessageMetadata::default())
    }

    /// Builds a signed message with explicit metadata.
    pub fn message_with(
        &self,
        receiver: &str,
        content: &str,
        kind: MessageKind,
        metadata: MessageMetadata,
    ) -> Message {
        Message::signed(self.id.clone(), receiver, content, kind, metadata, &self.identity)
            .expect("signing")
    }

    /// Receives the next inbox message within a short deadline.
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(1), self.mailbox.inbox.recv())
            .await
            .expect("timed out waiting for inbox message")
            .expect("inbox closed")
    }
}

/// Creates a hub with default config over a lexical registry.
pub fn hub() -> Arc<Hub> {
    hub_with_config(HubConfig::default())
}

/// Creates a hub with a custom config.
pub fn hub_with_config(config: HubConfig) -> Arc<Hub> {
    let registry = Arc::new(Registry::new(0.3, None));
    Hub::new(registry, config, Arc::new(NoopSink))
}

/// Registers an agent with the given capabilities.
pub async fn join(hub: &Hub, agent_id: &str, capabilities: Vec<Capability>) -> TestAgent {
    let identity = AgentIdentity::generate();
    let mut profile = AgentProfile::ai(agent_id);
    profile.capabilities = capabilities;
    let mailbox = hub
        .register_agent(AgentRegistration::new(profile, &identity))
        .await
        .expect("registration");
    TestAgent {
        id: agent_id.to_string(),
        identity,
        mailbox,
    }
}
