//! Hub-level discovery: listing, filtering, timeout-partner exclusion.

mod common;

use std::time::Duration;

use common::{hub, join};
use weft_hub::SendOutcome;
use weft_protocol::MessageMetadata;
use weft_types::{Capability, MessageKind};

#[tokio::test]
async fn list_agents_reflects_registrations() {
    let hub = hub();
    let _alice = join(&hub, "alice", vec![]).await;
    let _bob = join(
        &hub,
        "bob",
        vec![Capability::new("summarize", "produce concise summaries")],
    )
    .await;

    let mut agents = hub.list_agents().await;
    agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0].agent_id, "alice");
    assert_eq!(agents[1].capabilities[0].name, "summarize");
    assert!(agents[0].score.is_none());

    hub.unregister_agent(&"alice".to_string()).await.unwrap();
    assert_eq!(hub.list_agents().await.len(), 1);
}

#[tokio::test]
async fn timed_out_partner_is_excluded_from_discovery() {
    let hub = hub();
    let alice = join(&hub, "alice", vec![]).await;
    let _bob = join(
        &hub,
        "bob",
        vec![Capability::new("analyze", "analyze structured data tables")],
    )
    .await;
    let _carol = join(
        &hub,
        "carol",
        vec![Capability::new("analyze", "analyze structured data tables")],
    )
    .await;

    // Before any timeout, both providers are discoverable.
    let hits = hub
        .find_by_description("analyze data tables", Some(&"alice".to_string()), 10, Some(0.0))
        .await;
    let ids: Vec<&str> = hits.iter().map(|h| h.agent_id.as_str()).collect();
    assert!(ids.contains(&"bob"));
    assert!(ids.contains(&"carol"));

    // Bob leaves alice's request hanging.
    let request = alice.message_with(
        "bob",
        "slow analysis",
        MessageKind::Command,
        MessageMetadata::for_request("req-hang"),
    );
    let (outcome, _) = hub.send_and_wait(request, Duration::from_millis(100)).await;
    assert!(matches!(outcome, SendOutcome::TimedOut));

    // Bob is now filtered out of alice's discovery results; carol remains.
    let hits = hub
        .find_by_description("analyze data tables", Some(&"alice".to_string()), 10, Some(0.0))
        .await;
    let ids: Vec<&str> = hits.iter().map(|h| h.agent_id.as_str()).collect();
    assert!(!ids.contains(&"bob"));
    assert!(ids.contains(&"carol"));

    // Other requesters still see bob.
    let hits = hub
        .find_by_description("analyze data tables", Some(&"carol".to_string()), 10, Some(0.0))
        .await;
    let ids: Vec<&str> = hits.iter().map(|h| h.agent_id.as_str()).collect();
    assert!(ids.contains(&"bob"));
}

#[tokio::test]
async fn requester_never_discovers_itself() {
    let hub = hub();
    let _bob = join(
        &hub,
        "bob",
        vec![Capability::new("analyze", "analyze structured data tables")],
    )
    .await;

    let hits = hub
        .find_by_description("analyze data tables", Some(&"bob".to_string()), 10, Some(0.0))
        .await;
    assert!(hits.is_empty());
}

#[tokio::test]
async fn exact_discovery_carries_payment_addresses() {
    let hub = hub();
    let identity = weft_identity::AgentIdentity::generate();
    let profile = weft_types::AgentProfile::ai("paid")
        .with_capability(Capability::new("transcribe", "transcribe audio recordings"))
        .with_payment_address("0xpaid");
    hub.register_agent(weft_registry::AgentRegistration::new(profile, &identity))
        .await
        .unwrap();

    let hits = hub.find_by_capability("transcribe").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].payment_address.as_deref(), Some("0xpaid"));
}
