//! Top-level construction of a Weft fabric.
//!
//! A [`Fabric`] owns the registry, the hub, and the default interaction
//! limits, wired together from one [`FabricConfig`]. There is no module-scope
//! mutable state anywhere in the workspace: everything hangs off this object,
//! and dropping it (after [`Fabric::shutdown`]) tears the whole fabric down.
//!
//! ```no_run
//! # async fn example() {
//! use std::sync::Arc;
//! use weft_fabric::{load_config, Fabric};
//! use weft_runtime::EchoEngine;
//! use weft_types::{AgentProfile, Capability};
//!
//! let config = load_config(None).expect("config");
//! weft_fabric::init_tracing(&config.logging);
//! let fabric = Fabric::new(config);
//!
//! let profile = AgentProfile::ai("summarizer")
//!     .with_capability(Capability::new("summarize", "produce concise summaries"));
//! fabric
//!     .spawn_agent(profile, Box::new(EchoEngine::new(50)))
//!     .await
//!     .expect("spawn");
//!
//! fabric.shutdown().await;
//! # }
//! ```

mod config;

pub use config::{
    init_tracing, load_config, ConfigError, DiscoverySection, FabricConfig, HubSection,
    LimitsSection, LoggingConfig,
};

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use weft_control::RateLimits;
use weft_discovery::EmbeddingIndex;
use weft_hub::{AgentMailbox, Hub, HubConfig, HubError, SendOutcome};
use weft_identity::{AgentIdentity, IdentityError, KeyStore, KeyStoreError};
use weft_observe::{NoopSink, ObserverSink};
use weft_protocol::Message;
use weft_registry::{AgentRegistration, Registry, RegistryError};
use weft_runtime::{ReasoningEngine, RunningAgent};
use weft_types::{AgentId, AgentProfile};

/// Errors raised while assembling or operating a fabric.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// A hub operation failed.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Identity material could not be used.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The key store failed.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

/// A fully wired fabric: registry, hub, and agent runtimes.
pub struct Fabric {
    config: FabricConfig,
    registry: Arc<Registry>,
    hub: Arc<Hub>,
    agents: Mutex<Vec<RunningAgent>>,
}

impl Fabric {
    /// Builds a fabric with a lexical (degraded-mode) capability index and a
    /// no-op observability sink.
    pub fn new(config: FabricConfig) -> Self {
        Self::build(config, None, Arc::new(NoopSink))
    }

    /// Builds a fabric with an embedding backend for semantic discovery.
    pub fn with_embedding_index(config: FabricConfig, backend: Arc<dyn EmbeddingIndex>) -> Self {
        Self::build(config, Some(backend), Arc::new(NoopSink))
    }

    /// Builds a fabric with full control over collaborators.
    pub fn with_collaborators(
        config: FabricConfig,
        backend: Option<Arc<dyn EmbeddingIndex>>,
        sink: Arc<dyn ObserverSink>,
    ) -> Self {
        Self::build(config, backend, sink)
    }

    fn build(
        config: FabricConfig,
        backend: Option<Arc<dyn EmbeddingIndex>>,
        sink: Arc<dyn ObserverSink>,
    ) -> Self {
        let registry = Arc::new(match backend {
            Some(backend) => Registry::with_embedding_index(
                backend,
                config.discovery.min_score,
                config.discovery.liveness_threshold(),
            ),
            None => Registry::new(
                config.discovery.min_score,
                config.discovery.liveness_threshold(),
            ),
        });

        let hub_config = HubConfig {
            inbox_capacity: config.hub.inbox_capacity,
            history_capacity: config.hub.history_capacity,
            late_retention: Duration::from_secs(config.hub.late_retention_secs),
            janitor_interval: Duration::from_secs(config.hub.janitor_interval_secs),
            timeout_partner_ttl: Duration::from_secs(config.hub.timeout_partner_ttl_secs),
        };
        let hub = Hub::new(registry.clone(), hub_config, sink);

        Self {
            config,
            registry,
            hub,
            agents: Mutex::new(Vec::new()),
        }
    }

    /// The fabric configuration.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// The routing hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The rate limits applied to spawned agents.
    pub fn limits(&self) -> RateLimits {
        RateLimits {
            max_tokens_per_minute: self.config.limits.max_tokens_per_minute,
            max_tokens_per_hour: self.config.limits.max_tokens_per_hour,
            max_turns: self.config.limits.max_turns,
        }
    }

    /// Spawns an agent with a fresh identity.
    pub async fn spawn_agent(
        &self,
        profile: AgentProfile,
        engine: Box<dyn ReasoningEngine>,
    ) -> Result<AgentId, FabricError> {
        self.spawn_agent_with_identity(profile, AgentIdentity::generate(), engine)
            .await
    }

    /// Spawns an agent whose identity is loaded from (or first saved to) a
    /// key store, so the agent keeps its DID across restarts.
    pub async fn spawn_agent_with_keystore(
        &self,
        profile: AgentProfile,
        engine: Box<dyn ReasoningEngine>,
        store: &dyn KeyStore,
    ) -> Result<AgentId, FabricError> {
        let identity = match store.load(&profile.agent_id)? {
            Some(material) => AgentIdentity::from_material(&material)?,
            None => {
                let identity = AgentIdentity::generate();
                store.save(&profile.agent_id, &identity.export_material()?)?;
                identity
            }
        };
        self.spawn_agent_with_identity(profile, identity, engine).await
    }

    /// Spawns an agent with an explicit identity.
    pub async fn spawn_agent_with_identity(
        &self,
        profile: AgentProfile,
        identity: AgentIdentity,
        engine: Box<dyn ReasoningEngine>,
    ) -> Result<AgentId, FabricError> {
        let agent_id = profile.agent_id.clone();
        let registration = AgentRegistration::new(profile.clone(), &identity);
        let mailbox = self.hub.register_agent(registration).await?;

        let running = weft_runtime::spawn(
            profile,
            identity,
            mailbox,
            self.hub.clone(),
            engine,
            self.limits(),
        );
        self.agents.lock().expect("agents lock").push(running);
        Ok(agent_id)
    }

    /// Registers a mailbox-only participant (a front-end client driving a
    /// human side of conversations). The caller owns the mailbox.
    pub async fn attach_client(
        &self,
        profile: AgentProfile,
        identity: &AgentIdentity,
    ) -> Result<AgentMailbox, FabricError> {
        let registration = AgentRegistration::new(profile, identity);
        Ok(self.hub.register_agent(registration).await?)
    }

    /// Stops a spawned agent and waits for its runtime to drain.
    pub async fn stop_agent(&self, agent_id: &AgentId) -> Result<(), FabricError> {
        let running = {
            let mut agents = self.agents.lock().expect("agents lock");
            agents
                .iter()
                .position(|a| a.agent_id() == agent_id)
                .map(|idx| agents.swap_remove(idx))
        };
        match running {
            Some(running) => {
                running.stop(&self.hub).await;
                Ok(())
            }
            None => {
                self.hub.unregister_agent(agent_id).await?;
                Ok(())
            }
        }
    }

    /// Routes a directed request and waits up to the configured default
    /// timeout for the reply.
    pub async fn ask(&self, request: Message) -> (SendOutcome, String) {
        let timeout = Duration::from_secs(self.config.hub.request_timeout_secs);
        self.hub.send_and_wait(request, timeout).await
    }

    /// Stops the hub and joins every spawned runtime, aborting stragglers
    /// after a grace period.
    pub async fn shutdown(&self) {
        self.hub.stop().await;

        let agents: Vec<RunningAgent> = self.agents.lock().expect("agents lock").drain(..).collect();
        for running in agents {
            let agent_id = running.agent_id().to_string();
            let abort = running.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), running.join())
                .await
                .is_err()
            {
                tracing::warn!(agent = %agent_id, "runtime did not stop within grace period, aborting");
                abort.abort();
            }
        }
        tracing::info!("fabric shut down");
    }
}
