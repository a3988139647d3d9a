//! Agent registry for the Weft fabric.
//!
//! The directory of live agents: registration lifecycle, capability and
//! organization indexes, owner tracking, and liveness. Wraps the capability
//! index from `weft-discovery` so every registration change keeps exact and
//! semantic search in sync.
//!
//! All state sits behind one reader-writer lock: registrations and index
//! updates happen inside the write critical section, reads run in parallel.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use weft_discovery::{CapabilityIndex, DiscoveryError, EmbeddingIndex};
use weft_identity::AgentIdentity;
use weft_types::{AgentId, AgentProfile, Capability, DiscoveredAgent, InteractionMode};

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// An agent with this id is already registered.
    #[error("agent '{0}' is already registered")]
    DuplicateAgent(AgentId),

    /// The registration's identity has not been verified.
    #[error("identity for agent '{0}' is not verified")]
    UnverifiedIdentity(AgentId),

    /// The registration's DID does not match its public key.
    #[error("identity for agent '{0}' carries a DID that does not match its key")]
    IdentityMismatch(AgentId),

    /// No such agent.
    #[error("agent '{0}' is not registered")]
    UnknownAgent(AgentId),

    /// The capability index failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// A complete registration record.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    /// The agent's descriptive profile.
    pub profile: AgentProfile,
    /// Verification-only identity (no signing key crosses this boundary).
    pub identity: AgentIdentity,
    /// Owner of the agent, if tracked.
    pub owner_id: Option<String>,
    /// When the registration was accepted.
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    /// Builds a registration from a profile and the agent's identity.
    ///
    /// Only the public view of the identity is retained.
    pub fn new(profile: AgentProfile, identity: &AgentIdentity) -> Self {
        Self {
            profile,
            identity: identity.public_view(),
            owner_id: None,
            registered_at: Utc::now(),
        }
    }

    /// Sets the owner, builder-style.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Projects this registration into a discovery result entry.
    pub fn to_discovered(&self, score: Option<f32>) -> DiscoveredAgent {
        DiscoveredAgent {
            agent_id: self.profile.agent_id.clone(),
            organization_id: self.profile.organization_id.clone(),
            agent_type: self.profile.agent_type,
            capabilities: self.profile.capabilities.clone(),
            payment_address: self.profile.payment_address.clone(),
            score,
        }
    }
}

/// Fields of a registration that may change after the fact.
#[derive(Debug, Default, Clone)]
pub struct RegistrationUpdate {
    /// Replacement capability set.
    pub capabilities: Option<Vec<Capability>>,
    /// Replacement interaction modes.
    pub interaction_modes: Option<Vec<InteractionMode>>,
    /// New payment address (`Some(None)` clears it).
    pub payment_address: Option<Option<String>>,
}

/// Options for a semantic discovery query.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Maximum number of results.
    pub limit: usize,
    /// Minimum normalized score; `None` uses the registry default.
    pub min_score: Option<f32>,
    /// The querying agent, excluded from results.
    pub requester: Option<AgentId>,
    /// Further agents to exclude (e.g. recent timeout partners).
    pub exclude: Vec<AgentId>,
    /// Whether inactive agents are filtered out.
    pub active_only: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: None,
            requester: None,
            exclude: Vec::new(),
            active_only: true,
        }
    }
}

struct RegistryState {
    agents: HashMap<AgentId, AgentRegistration>,
    index: CapabilityIndex,
    organizations: HashMap<String, Vec<AgentId>>,
    owners: HashMap<String, Vec<AgentId>>,
    modes: HashMap<InteractionMode, HashSet<AgentId>>,
    last_seen: HashMap<AgentId, Instant>,
}

/// The agent directory.
pub struct Registry {
    state: RwLock<RegistryState>,
    default_min_score: f32,
    liveness_threshold: Option<Duration>,
}

impl Registry {
    /// Creates a registry with a lexical (degraded-mode) capability index.
    pub fn new(default_min_score: f32, liveness_threshold: Option<Duration>) -> Self {
        Self::build(CapabilityIndex::new(), default_min_score, liveness_threshold)
    }

    /// Creates a registry backed by an embedding index.
    pub fn with_embedding_index(
        backend: Arc<dyn EmbeddingIndex>,
        default_min_score: f32,
        liveness_threshold: Option<Duration>,
    ) -> Self {
        Self::build(
            CapabilityIndex::with_backend(backend),
            default_min_score,
            liveness_threshold,
        )
    }

    fn build(
        index: CapabilityIndex,
        default_min_score: f32,
        liveness_threshold: Option<Duration>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                agents: HashMap::new(),
                index,
                organizations: HashMap::new(),
                owners: HashMap::new(),
                modes: HashMap::new(),
                last_seen: HashMap::new(),
            }),
            default_min_score,
            liveness_threshold,
        }
    }

    /// Registers an agent.
    ///
    /// # Errors
    ///
    /// Fails on duplicate ids, unverified identities, and identities whose
    /// DID does not match their public key.
    pub async fn register(&self, registration: AgentRegistration) -> Result<(), RegistryError> {
        let agent_id = registration.profile.agent_id.clone();

        if !registration.identity.is_verified() {
            return Err(RegistryError::UnverifiedIdentity(agent_id));
        }
        if !registration.identity.did_matches_key() {
            return Err(RegistryError::IdentityMismatch(agent_id));
        }

        let mut state = self.state.write().await;
        if state.agents.contains_key(&agent_id) {
            return Err(RegistryError::DuplicateAgent(agent_id));
        }

        state
            .index
            .insert(&agent_id, &registration.profile.capabilities)?;

        if let Some(org) = &registration.profile.organization_id {
            state
                .organizations
                .entry(org.clone())
                .or_default()
                .push(agent_id.clone());
        }
        if let Some(owner) = &registration.owner_id {
            state
                .owners
                .entry(owner.clone())
                .or_default()
                .push(agent_id.clone());
        }
        for mode in &registration.profile.interaction_modes {
            state.modes.entry(*mode).or_default().insert(agent_id.clone());
        }
        state.last_seen.insert(agent_id.clone(), Instant::now());
        state.agents.insert(agent_id.clone(), registration);

        tracing::info!(agent = %agent_id, "agent registered");
        Ok(())
    }

    /// Removes an agent. Idempotent: unknown ids are a no-op.
    pub async fn unregister(&self, agent_id: &AgentId) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let Some(registration) = state.agents.remove(agent_id) else {
            return Ok(());
        };

        state.index.remove(agent_id)?;

        if let Some(org) = &registration.profile.organization_id {
            if let Some(members) = state.organizations.get_mut(org) {
                members.retain(|id| id != agent_id);
                if members.is_empty() {
                    state.organizations.remove(org);
                }
            }
        }
        if let Some(owner) = &registration.owner_id {
            if let Some(owned) = state.owners.get_mut(owner) {
                owned.retain(|id| id != agent_id);
                if owned.is_empty() {
                    state.owners.remove(owner);
                }
            }
        }
        for mode in &registration.profile.interaction_modes {
            if let Some(members) = state.modes.get_mut(mode) {
                members.remove(agent_id);
            }
        }
        state.last_seen.remove(agent_id);

        tracing::info!(agent = %agent_id, "agent unregistered");
        Ok(())
    }

    /// Looks up a registration.
    pub async fn get(&self, agent_id: &AgentId) -> Option<AgentRegistration> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// Whether the agent is currently registered.
    pub async fn contains(&self, agent_id: &AgentId) -> bool {
        self.state.read().await.agents.contains_key(agent_id)
    }

    /// Exact capability lookup, in registration order.
    pub async fn get_by_capability(&self, name: &str) -> Vec<AgentRegistration> {
        let state = self.state.read().await;
        state
            .index
            .find_by_name(name)
            .iter()
            .filter_map(|id| state.agents.get(id).cloned())
            .collect()
    }

    /// Semantic capability lookup with filtering.
    pub async fn get_by_capability_description(
        &self,
        query: &str,
        options: &DiscoveryOptions,
    ) -> Vec<(AgentRegistration, f32)> {
        let min_score = options.min_score.unwrap_or(self.default_min_score);
        let state = self.state.read().await;

        // Over-fetch so post-filtering can still fill the limit.
        let fetch = options.limit + options.exclude.len() + usize::from(options.requester.is_some());
        let hits = state.index.find_by_description(query, fetch, min_score);

        let mut results = Vec::new();
        for (agent_id, score) in hits {
            if results.len() >= options.limit {
                break;
            }
            if options.requester.as_ref() == Some(&agent_id) {
                continue;
            }
            if options.exclude.contains(&agent_id) {
                continue;
            }
            if options.active_only && !self.is_active_locked(&state, &agent_id) {
                continue;
            }
            if let Some(registration) = state.agents.get(&agent_id) {
                results.push((registration.clone(), score));
            }
        }
        results
    }

    /// Agents belonging to an organization, in registration order.
    pub async fn get_by_organization(&self, organization_id: &str) -> Vec<AgentRegistration> {
        let state = self.state.read().await;
        state
            .organizations
            .get(organization_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.agents.get(id).cloned())
            .collect()
    }

    /// Agents registered by an owner.
    pub async fn get_by_owner(&self, owner_id: &str) -> Vec<AgentRegistration> {
        let state = self.state.read().await;
        state
            .owners
            .get(owner_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.agents.get(id).cloned())
            .collect()
    }

    /// Whether `owner_id` owns `agent_id`.
    pub async fn verify_owner(&self, agent_id: &AgentId, owner_id: &str) -> bool {
        self.state
            .read()
            .await
            .agents
            .get(agent_id)
            .is_some_and(|r| r.owner_id.as_deref() == Some(owner_id))
    }

    /// Agents supporting an interaction mode.
    pub async fn get_by_interaction_mode(&self, mode: InteractionMode) -> Vec<AgentRegistration> {
        let state = self.state.read().await;
        let mut results: Vec<AgentRegistration> = state
            .modes
            .get(&mode)
            .into_iter()
            .flatten()
            .filter_map(|id| state.agents.get(id).cloned())
            .collect();
        results.sort_by(|a, b| a.profile.agent_id.cmp(&b.profile.agent_id));
        results
    }

    /// All registrations.
    pub async fn all_agents(&self) -> Vec<AgentRegistration> {
        self.state.read().await.agents.values().cloned().collect()
    }

    /// All distinct capability names.
    pub async fn all_capabilities(&self) -> Vec<String> {
        self.state.read().await.index.capability_names()
    }

    /// Records activity for an agent (called by the hub on each routed
    /// message from it).
    pub async fn touch(&self, agent_id: &AgentId) {
        let mut state = self.state.write().await;
        if state.agents.contains_key(agent_id) {
            state.last_seen.insert(agent_id.clone(), Instant::now());
        }
    }

    /// Whether the agent is registered and recently active.
    ///
    /// With no liveness threshold configured, registration alone counts as
    /// active.
    pub async fn is_active(&self, agent_id: &AgentId) -> bool {
        let state = self.state.read().await;
        self.is_active_locked(&state, agent_id)
    }

    fn is_active_locked(&self, state: &RegistryState, agent_id: &AgentId) -> bool {
        if !state.agents.contains_key(agent_id) {
            return false;
        }
        match self.liveness_threshold {
            None => true,
            Some(threshold) => state
                .last_seen
                .get(agent_id)
                .is_some_and(|seen| seen.elapsed() <= threshold),
        }
    }

    /// Applies a partial update to a registration, maintaining all indexes.
    pub async fn update_registration(
        &self,
        agent_id: &AgentId,
        update: RegistrationUpdate,
    ) -> Result<AgentRegistration, RegistryError> {
        let mut state = self.state.write().await;
        if !state.agents.contains_key(agent_id) {
            return Err(RegistryError::UnknownAgent(agent_id.clone()));
        }

        if let Some(capabilities) = update.capabilities {
            state.index.remove(agent_id)?;
            state.index.insert(agent_id, &capabilities)?;
            let registration = state.agents.get_mut(agent_id).expect("checked above");
            registration.profile.capabilities = capabilities;
        }

        if let Some(modes) = update.interaction_modes {
            let old_modes = state
                .agents
                .get(agent_id)
                .expect("checked above")
                .profile
                .interaction_modes
                .clone();
            for mode in old_modes {
                if let Some(members) = state.modes.get_mut(&mode) {
                    members.remove(agent_id);
                }
            }
            for mode in &modes {
                state.modes.entry(*mode).or_default().insert(agent_id.clone());
            }
            let registration = state.agents.get_mut(agent_id).expect("checked above");
            registration.profile.interaction_modes = modes;
        }

        if let Some(payment_address) = update.payment_address {
            let registration = state.agents.get_mut(agent_id).expect("checked above");
            registration.profile.payment_address = payment_address;
        }

        Ok(state.agents.get(agent_id).expect("checked above").clone())
    }

    /// Persists the semantic index through the embedding backend.
    pub async fn save_index(&self, path: &Path) -> Result<(), RegistryError> {
        self.state.read().await.index.persist(path)?;
        Ok(())
    }

    /// Restores the semantic index through the embedding backend.
    pub async fn load_index(&self, path: &Path) -> Result<(), RegistryError> {
        self.state.read().await.index.restore(path)?;
        Ok(())
    }
}
