//! Two cooperating agents and a client, end to end.
//!
//! Run with: `cargo run -p weft-fabric --example collaboration`
//!
//! A summarizer and a translator join the fabric, a client discovers the
//! right agent by capability description, sends it a collaboration request,
//! and waits for the reply.

use std::time::Duration;

use async_trait::async_trait;
use weft_fabric::{load_config, Fabric};
use weft_hub::SendOutcome;
use weft_identity::AgentIdentity;
use weft_protocol::{Message, MessageMetadata};
use weft_runtime::{EngineError, EngineReply, ReasoningEngine};
use weft_types::{AgentProfile, Capability, MessageKind};

/// A toy engine that pretends to summarize.
struct Summarizer;

#[async_trait]
impl ReasoningEngine for Summarizer {
    async fn handle(&mut self, message: &Message) -> Result<Option<EngineReply>, EngineError> {
        let words: Vec<&str> = message.content.split_whitespace().take(8).collect();
        Ok(Some(EngineReply::text(format!(
            "summary: {}...",
            words.join(" ")
        ))))
    }

    fn last_token_usage(&self) -> u64 {
        42
    }
}

/// A toy engine that pretends to translate.
struct Translator;

#[async_trait]
impl ReasoningEngine for Translator {
    async fn handle(&mut self, message: &Message) -> Result<Option<EngineReply>, EngineError> {
        Ok(Some(EngineReply::text(format!(
            "traduccion: {}",
            message.content
        ))))
    }

    fn last_token_usage(&self) -> u64 {
        17
    }
}

#[tokio::main]
async fn main() {
    let config = load_config(None).expect("default config is always valid");
    weft_fabric::init_tracing(&config.logging);
    let fabric = Fabric::new(config);

    fabric
        .spawn_agent(
            AgentProfile::ai("summarizer")
                .with_capability(Capability::new(
                    "summarize",
                    "produce concise summaries of long text documents",
                ))
                .with_payment_address("0xsummarizer"),
            Box::new(Summarizer),
        )
        .await
        .expect("spawn summarizer");

    fabric
        .spawn_agent(
            AgentProfile::ai("translator").with_capability(Capability::new(
                "translate",
                "translate text between English and Spanish",
            )),
            Box::new(Translator),
        )
        .await
        .expect("spawn translator");

    // A client joins with its own identity and mailbox.
    let identity = AgentIdentity::generate();
    let _mailbox = fabric
        .attach_client(AgentProfile::human("client"), &identity)
        .await
        .expect("attach client");

    // Discover who can summarize.
    let hits = fabric
        .hub()
        .find_by_description(
            "produce a concise summary of a long document",
            Some(&"client".to_string()),
            3,
            None,
        )
        .await;
    let provider = hits.first().expect("a provider should match");
    println!(
        "discovered '{}' (score {:.2}, payment address {:?})",
        provider.agent_id,
        provider.score.unwrap_or_default(),
        provider.payment_address
    );

    // Ask it to collaborate.
    let mut metadata = MessageMetadata::for_request("req-demo");
    metadata.capability = Some("summarize".into());
    let request = Message::signed(
        "client",
        provider.agent_id.clone(),
        "The fabric routes cryptographically signed messages between \
         autonomous agents that discover one another by capability rather \
         than by address, with timeouts and late-delivery recovery.",
        MessageKind::RequestCollaboration,
        metadata,
        &identity,
    )
    .expect("signing");

    match fabric.hub().send_and_wait(request, Duration::from_secs(5)).await {
        (SendOutcome::Completed(response), _) => {
            println!("{} replied: {}", response.sender_id, response.content);
        }
        (SendOutcome::TimedOut, request_id) => {
            println!("no reply in time; poll later with request id {request_id}");
        }
        (SendOutcome::Failed(e), _) => {
            println!("request failed: {e}");
        }
    }

    fabric.shutdown().await;
}
