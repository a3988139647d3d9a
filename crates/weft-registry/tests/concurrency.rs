//! Registry behavior under concurrent access.

use std::sync::Arc;

use weft_identity::AgentIdentity;
use weft_registry::{AgentRegistration, DiscoveryOptions, Registry};
use weft_types::{AgentProfile, Capability};

fn registration(agent_id: &str) -> AgentRegistration {
    let identity = AgentIdentity::generate();
    let profile = AgentProfile::ai(agent_id)
        .with_capability(Capability::new("analyze", "analyze structured data tables"));
    AgentRegistration::new(profile, &identity)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_registrations_all_land() {
    let registry = Arc::new(Registry::new(0.0, None));

    let mut handles = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.register(registration(&format!("agent-{i}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(registry.all_agents().await.len(), 32);
    assert_eq!(registry.get_by_capability("analyze").await.len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_run_during_churn() {
    let registry = Arc::new(Registry::new(0.0, None));
    for i in 0..8 {
        registry.register(registration(&format!("stable-{i}"))).await.unwrap();
    }

    // Writers churn a second population while readers query the first.
    let writer = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for round in 0..20 {
                let id = format!("churn-{round}");
                registry.register(registration(&id)).await.unwrap();
                registry.unregister(&id).await.unwrap();
            }
        })
    };

    let reader = {
        let registry = registry.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let hits = registry
                    .get_by_capability_description(
                        "analyze data tables",
                        &DiscoveryOptions::default(),
                    )
                    .await;
                assert!(hits.len() >= 8);
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();

    // The stable population survived the churn intact.
    assert_eq!(registry.all_agents().await.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_race_admits_exactly_one() {
    let registry = Arc::new(Registry::new(0.0, None));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.register(registration("contested")).await.is_ok()
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(registry.all_agents().await.len(), 1);
}
