//! End-to-end fabric scenarios: spawn, converse, discover, shut down.

use std::time::Duration;

use weft_fabric::{Fabric, FabricConfig};
use weft_hub::{HubError, RequestPoll, SendOutcome};
use weft_identity::{AgentIdentity, MemoryKeyStore};
use weft_protocol::{Message, MessageMetadata};
use weft_runtime::{EchoEngine, SilentEngine};
use weft_types::{AgentProfile, Capability, MessageKind};

async fn client(fabric: &Fabric, id: &str) -> (AgentIdentity, weft_hub::AgentMailbox) {
    let identity = AgentIdentity::generate();
    let mailbox = fabric
        .attach_client(AgentProfile::human(id), &identity)
        .await
        .expect("attach client");
    (identity, mailbox)
}

fn signed(
    identity: &AgentIdentity,
    sender: &str,
    receiver: &str,
    content: &str,
    kind: MessageKind,
    metadata: MessageMetadata,
) -> Message {
    Message::signed(sender, receiver, content, kind, metadata, identity).expect("signing")
}

#[tokio::test]
async fn client_converses_with_spawned_agent() {
    let fabric = Fabric::new(FabricConfig::default());
    fabric
        .spawn_agent(AgentProfile::ai("bob"), Box::new(EchoEngine::new(10)))
        .await
        .unwrap();
    let (identity, mut mailbox) = client(&fabric, "alice").await;

    fabric
        .hub()
        .route(signed(
            &identity,
            "alice",
            "bob",
            "hello fabric",
            MessageKind::Text,
            MessageMetadata::default(),
        ))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), mailbox.inbox.recv())
        .await
        .expect("reply in time")
        .expect("inbox open");
    assert_eq!(reply.content, "echo: hello fabric");

    fabric.shutdown().await;
}

#[tokio::test]
async fn ask_uses_the_configured_timeout_and_late_polling_works() {
    let mut config = FabricConfig::default();
    config.hub.request_timeout_secs = 1;
    let fabric = Fabric::new(config);

    // A silent agent never answers.
    fabric
        .spawn_agent(AgentProfile::ai("mute"), Box::new(SilentEngine))
        .await
        .unwrap();
    let (identity, _mailbox) = client(&fabric, "alice").await;

    let request = signed(
        &identity,
        "alice",
        "mute",
        "anything there?",
        MessageKind::Command,
        MessageMetadata::for_request("req-mute"),
    );
    let (outcome, request_id) = fabric.ask(request).await;
    assert!(matches!(outcome, SendOutcome::TimedOut));
    assert!(matches!(
        fabric.hub().check_late_result(&request_id),
        RequestPoll::TimedOut
    ));

    fabric.shutdown().await;
}

#[tokio::test]
async fn discovery_finds_spawned_capabilities() {
    let fabric = Fabric::new(FabricConfig::default());
    fabric
        .spawn_agent(
            AgentProfile::ai("summarizer")
                .with_capability(Capability::new(
                    "summarize",
                    "produce concise summaries of long text",
                ))
                .with_payment_address("0xsum"),
            Box::new(EchoEngine::new(1)),
        )
        .await
        .unwrap();
    fabric
        .spawn_agent(
            AgentProfile::ai("translator").with_capability(Capability::new(
                "translate",
                "translate between English and Spanish",
            )),
            Box::new(EchoEngine::new(1)),
        )
        .await
        .unwrap();

    // Exact lookup.
    let exact = fabric.hub().find_by_capability("summarize").await;
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].agent_id, "summarizer");
    assert_eq!(exact[0].payment_address.as_deref(), Some("0xsum"));
    assert!(fabric.hub().find_by_capability("nope").await.is_empty());

    // Semantic lookup in degraded lexical mode.
    let semantic = fabric
        .hub()
        .find_by_description("concise summaries of text", None, 2, Some(0.0))
        .await;
    assert!(!semantic.is_empty());
    assert_eq!(semantic[0].agent_id, "summarizer");
    let score = semantic[0].score.expect("semantic score");
    assert!((0.0..=1.0).contains(&score));

    fabric.shutdown().await;
}

#[tokio::test]
async fn keystore_spawn_preserves_the_did_across_restarts() {
    let store = MemoryKeyStore::new();
    let fabric = Fabric::new(FabricConfig::default());

    fabric
        .spawn_agent_with_keystore(AgentProfile::ai("bob"), Box::new(EchoEngine::new(1)), &store)
        .await
        .unwrap();
    let first_did = fabric
        .registry()
        .get(&"bob".to_string())
        .await
        .unwrap()
        .identity
        .did()
        .to_string();

    fabric.stop_agent(&"bob".to_string()).await.unwrap();

    fabric
        .spawn_agent_with_keystore(AgentProfile::ai("bob"), Box::new(EchoEngine::new(1)), &store)
        .await
        .unwrap();
    let second_did = fabric
        .registry()
        .get(&"bob".to_string())
        .await
        .unwrap()
        .identity
        .did()
        .to_string();

    assert_eq!(first_did, second_did);
    fabric.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let fabric = Fabric::new(FabricConfig::default());
    fabric
        .spawn_agent(AgentProfile::ai("bob"), Box::new(EchoEngine::new(1)))
        .await
        .unwrap();
    let (identity, _mailbox) = client(&fabric, "alice").await;

    fabric.shutdown().await;
    assert!(fabric.hub().is_stopped());

    let err = fabric
        .hub()
        .route(signed(
            &identity,
            "alice",
            "bob",
            "anyone home?",
            MessageKind::Text,
            MessageMetadata::default(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::ShuttingDown));

    let spawn_err = fabric
        .spawn_agent(AgentProfile::ai("late"), Box::new(EchoEngine::new(1)))
        .await;
    assert!(spawn_err.is_err());
}

#[tokio::test]
async fn collaboration_flow_across_spawned_agents() {
    let fabric = Fabric::new(FabricConfig::default());
    fabric
        .spawn_agent(
            AgentProfile::ai("analyst")
                .with_capability(Capability::new("analyze", "analyze structured data")),
            Box::new(EchoEngine::new(5)),
        )
        .await
        .unwrap();
    let (identity, _mailbox) = client(&fabric, "alice").await;

    let mut metadata = MessageMetadata::for_request("req-collab");
    metadata.capability = Some("analyze".into());
    let request = signed(
        &identity,
        "alice",
        "analyst",
        "please analyze this table",
        MessageKind::RequestCollaboration,
        metadata,
    );

    let (outcome, _) = fabric.ask(request).await;
    match outcome {
        SendOutcome::Completed(response) => {
            assert_eq!(response.kind, MessageKind::ResponseCollaboration);
            assert_eq!(response.content, "echo: please analyze this table");
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    fabric.shutdown().await;
}
