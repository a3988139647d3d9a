//! Capability indexing and discovery for the Weft fabric.
//!
//! Two search modes are offered:
//!
//! - **Exact**: capability name to agent set, O(1).
//! - **Semantic**: free-text queries scored against capability descriptions.
//!   Embedding and nearest-neighbor search are delegated to an
//!   [`EmbeddingIndex`] collaborator; without one the index degrades to
//!   lexical substring-and-token-overlap scoring and logs the downgrade once.
//!
//! Descriptions are deduplicated: the embedding for a description is keyed by
//! its SHA-256 hash, so the same capability text registered by many agents is
//! embedded exactly once and re-embedded only when the text changes.

mod embedding;
mod lexical;

pub use embedding::{BagOfWordsIndex, EmbeddingIndex};
pub use lexical::lexical_score;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use weft_types::{AgentId, Capability};

/// Errors raised by discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The embedding backend reported a failure.
    #[error("embedding backend error: {0}")]
    Backend(String),

    /// Index persistence hit the filesystem.
    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),

    /// Index persistence could not encode or decode its state.
    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One agent/capability pair holding a reference to a shared description.
#[derive(Debug, Clone)]
struct Holder {
    agent_id: AgentId,
    capability: String,
    seq: u64,
}

/// A unique capability description and the agents advertising it.
#[derive(Debug, Clone)]
struct DescriptionEntry {
    text: String,
    holders: Vec<Holder>,
}

/// Capability index with exact and semantic lookup.
pub struct CapabilityIndex {
    backend: Option<Arc<dyn EmbeddingIndex>>,
    by_name: HashMap<String, Vec<AgentId>>,
    by_description: HashMap<String, DescriptionEntry>,
    agent_entries: HashMap<AgentId, Vec<(String, String)>>,
    next_seq: u64,
    degraded_logged: AtomicBool,
}

impl CapabilityIndex {
    /// Creates an index in degraded (lexical) mode.
    pub fn new() -> Self {
        Self {
            backend: None,
            by_name: HashMap::new(),
            by_description: HashMap::new(),
            agent_entries: HashMap::new(),
            next_seq: 0,
            degraded_logged: AtomicBool::new(false),
        }
    }

    /// Creates an index backed by an embedding collaborator.
    pub fn with_backend(backend: Arc<dyn EmbeddingIndex>) -> Self {
        let mut index = Self::new();
        index.backend = Some(backend);
        index
    }

    /// Whether semantic search runs on an embedding backend.
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Indexes an agent's capabilities, replacing any previous entries.
    pub fn insert(
        &mut self,
        agent_id: &AgentId,
        capabilities: &[Capability],
    ) -> Result<(), DiscoveryError> {
        if self.agent_entries.contains_key(agent_id) {
            self.remove(agent_id)?;
        }

        let mut entries = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let key = description_key(&capability.description);

            let named = self.by_name.entry(capability.name.clone()).or_default();
            if !named.contains(agent_id) {
                named.push(agent_id.clone());
            }

            let seq = self.next_seq;
            self.next_seq += 1;
            let holder = Holder {
                agent_id: agent_id.clone(),
                capability: capability.name.clone(),
                seq,
            };

            match self.by_description.get_mut(&key) {
                Some(entry) => entry.holders.push(holder),
                None => {
                    if let Some(backend) = &self.backend {
                        backend.upsert(&key, &capability.description)?;
                    }
                    self.by_description.insert(
                        key.clone(),
                        DescriptionEntry {
                            text: capability.description.clone(),
                            holders: vec![holder],
                        },
                    );
                }
            }

            entries.push((capability.name.clone(), key));
        }

        self.agent_entries.insert(agent_id.clone(), entries);
        Ok(())
    }

    /// Removes all of an agent's capability entries. Idempotent.
    ///
    /// Shared description embeddings are refcounted: the backend entry is
    /// dropped only when the last holder goes away.
    pub fn remove(&mut self, agent_id: &AgentId) -> Result<(), DiscoveryError> {
        let Some(entries) = self.agent_entries.remove(agent_id) else {
            return Ok(());
        };

        for (name, key) in entries {
            if let Some(named) = self.by_name.get_mut(&name) {
                named.retain(|id| id != agent_id);
                if named.is_empty() {
                    self.by_name.remove(&name);
                }
            }

            let drop_entry = match self.by_description.get_mut(&key) {
                Some(entry) => {
                    entry
                        .holders
                        .retain(|h| !(h.agent_id == *agent_id && h.capability == name));
                    entry.holders.is_empty()
                }
                None => false,
            };
            if drop_entry {
                self.by_description.remove(&key);
                if let Some(backend) = &self.backend {
                    backend.remove(&key)?;
                }
            }
        }
        Ok(())
    }

    /// Exact lookup: agents advertising a capability with this name, in
    /// registration order.
    pub fn find_by_name(&self, name: &str) -> Vec<AgentId> {
        self.by_name.get(name).cloned().unwrap_or_default()
    }

    /// All distinct capability names currently indexed.
    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Semantic lookup: agents whose capability descriptions match the query.
    ///
    /// Scores are normalized to [0, 1]; results are sorted descending by
    /// score with ties broken by insertion order, at most one entry per
    /// agent. With no backend configured (or a failing one) the index scores
    /// lexically and logs the degradation once.
    pub fn find_by_description(
        &self,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> Vec<(AgentId, f32)> {
        if limit == 0 {
            return Vec::new();
        }

        if let Some(backend) = &self.backend {
            match backend.query(query, limit.saturating_mul(2).max(limit)) {
                Ok(raw_hits) => return self.collect_backend_hits(raw_hits, limit, min_score),
                Err(e) => {
                    // A failing backend is not the no-backend degraded mode;
                    // this query falls back, the next one tries again.
                    tracing::warn!(error = %e, "embedding backend query failed, scoring lexically");
                }
            }
        } else {
            self.log_degraded_once();
        }

        self.collect_lexical_hits(query, limit, min_score)
    }

    fn collect_backend_hits(
        &self,
        raw_hits: Vec<(String, f32)>,
        limit: usize,
        min_score: f32,
    ) -> Vec<(AgentId, f32)> {
        let mut candidates: Vec<(AgentId, f32, u64)> = Vec::new();
        for (key, raw) in raw_hits {
            // Non-positive similarity means orthogonal or dissimilar.
            if raw <= 0.0 {
                continue;
            }
            let score = normalize_similarity(raw);
            if score < min_score {
                continue;
            }
            let Some(entry) = self.by_description.get(&key) else {
                continue;
            };
            for holder in &entry.holders {
                merge_candidate(&mut candidates, &holder.agent_id, score, holder.seq);
            }
        }
        rank(candidates, limit)
    }

    fn collect_lexical_hits(
        &self,
        query: &str,
        limit: usize,
        min_score: f32,
    ) -> Vec<(AgentId, f32)> {
        let mut candidates: Vec<(AgentId, f32, u64)> = Vec::new();
        for entry in self.by_description.values() {
            for holder in &entry.holders {
                let text = format!("{} {}", holder.capability, entry.text);
                let score = lexical_score(query, &text);
                if score < min_score || score <= 0.0 {
                    continue;
                }
                merge_candidate(&mut candidates, &holder.agent_id, score, holder.seq);
            }
        }
        rank(candidates, limit)
    }

    /// Persists the semantic index through the backend.
    ///
    /// A no-op in degraded mode: the lexical scorer has no state beyond the
    /// live registrations.
    pub fn persist(&self, path: &Path) -> Result<(), DiscoveryError> {
        match &self.backend {
            Some(backend) => backend.persist(path),
            None => Ok(()),
        }
    }

    /// Restores the semantic index through the backend.
    pub fn restore(&self, path: &Path) -> Result<(), DiscoveryError> {
        match &self.backend {
            Some(backend) => backend.restore(path),
            None => Ok(()),
        }
    }

    fn log_degraded_once(&self) {
        if !self.degraded_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "no embedding backend configured, semantic capability search is running in \
                 degraded lexical mode"
            );
        }
    }
}

impl Default for CapabilityIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a raw similarity from [-1, 1] into [0, 1], preserving order.
fn normalize_similarity(raw: f32) -> f32 {
    (raw.clamp(-1.0, 1.0) + 1.0) / 2.0
}

/// Keeps at most one candidate per agent: best score, earliest insertion.
fn merge_candidate(candidates: &mut Vec<(AgentId, f32, u64)>, agent_id: &AgentId, score: f32, seq: u64) {
    match candidates.iter_mut().find(|(id, _, _)| id == agent_id) {
        Some(existing) => {
            if score > existing.1 {
                existing.1 = score;
            }
            if seq < existing.2 {
                existing.2 = seq;
            }
        }
        None => candidates.push((agent_id.clone(), score, seq)),
    }
}

/// Sorts by score descending, ties by insertion order, and truncates.
fn rank(mut candidates: Vec<(AgentId, f32, u64)>, limit: usize) -> Vec<(AgentId, f32)> {
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.2.cmp(&b.2))
    });
    candidates
        .into_iter()
        .take(limit)
        .map(|(id, score, _)| (id, score))
        .collect()
}

/// Stable key for a capability description.
fn description_key(description: &str) -> String {
    hex::encode(Sha256::digest(description.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::Capability;

    fn cap(name: &str, description: &str) -> Capability {
        Capability::new(name, description)
    }

    #[test]
    fn exact_lookup_finds_registered_agents() {
        let mut index = CapabilityIndex::new();
        index
            .insert(&"r1".to_string(), &[cap("summarize", "produce summaries")])
            .unwrap();
        index
            .insert(&"r2".to_string(), &[cap("translate", "translate text")])
            .unwrap();

        assert_eq!(index.find_by_name("summarize"), vec!["r1".to_string()]);
        assert_eq!(index.find_by_name("translate"), vec!["r2".to_string()]);
        assert!(index.find_by_name("nope").is_empty());
    }

    #[test]
    fn remove_is_idempotent_and_refcounts_names() {
        let mut index = CapabilityIndex::new();
        let shared = cap("summarize", "produce summaries");
        index.insert(&"r1".to_string(), &[shared.clone()]).unwrap();
        index.insert(&"r2".to_string(), &[shared]).unwrap();

        index.remove(&"r1".to_string()).unwrap();
        assert_eq!(index.find_by_name("summarize"), vec!["r2".to_string()]);

        index.remove(&"r1".to_string()).unwrap();
        index.remove(&"r2".to_string()).unwrap();
        assert!(index.find_by_name("summarize").is_empty());
    }

    #[test]
    fn shared_description_is_embedded_once() {
        let backend = Arc::new(BagOfWordsIndex::new());
        let mut index = CapabilityIndex::with_backend(backend.clone());
        let description = "produce concise summaries of long text";

        index
            .insert(&"r1".to_string(), &[cap("summarize", description)])
            .unwrap();
        index
            .insert(&"r2".to_string(), &[cap("digest", description)])
            .unwrap();
        assert_eq!(backend.len(), 1);

        // Dropping one holder keeps the shared embedding alive.
        index.remove(&"r1".to_string()).unwrap();
        assert_eq!(backend.len(), 1);
        index.remove(&"r2".to_string()).unwrap();
        assert_eq!(backend.len(), 0);
    }

    #[test]
    fn reinsert_replaces_previous_capabilities() {
        let mut index = CapabilityIndex::new();
        index
            .insert(&"r1".to_string(), &[cap("summarize", "old description")])
            .unwrap();
        index
            .insert(&"r1".to_string(), &[cap("translate", "new description")])
            .unwrap();

        assert!(index.find_by_name("summarize").is_empty());
        assert_eq!(index.find_by_name("translate"), vec!["r1".to_string()]);
    }

    #[test]
    fn lexical_mode_ranks_overlapping_description_first() {
        let mut index = CapabilityIndex::new();
        index
            .insert(
                &"r1".to_string(),
                &[cap("summarize", "produce concise summaries of long text")],
            )
            .unwrap();
        index
            .insert(
                &"r2".to_string(),
                &[cap("translate", "translate between English and Spanish")],
            )
            .unwrap();

        let hits = index.find_by_description("produce a concise summary of a long document", 2, 0.0);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, "r1");
        if let Some(second) = hits.get(1) {
            assert!(hits[0].1 > second.1);
        }
    }

    #[test]
    fn backend_mode_ranks_by_cosine_similarity() {
        let backend = Arc::new(BagOfWordsIndex::new());
        let mut index = CapabilityIndex::with_backend(backend);
        index
            .insert(
                &"r1".to_string(),
                &[cap("summarize", "produce concise summaries of long text")],
            )
            .unwrap();
        index
            .insert(
                &"r2".to_string(),
                &[cap("translate", "translate between English and Spanish")],
            )
            .unwrap();

        let hits = index.find_by_description("concise summaries of text", 2, 0.0);
        assert_eq!(hits[0].0, "r1");
        assert!(hits[0].1 > 0.5);
        assert!(hits[0].1 <= 1.0);
    }

    #[test]
    fn scores_are_normalized_and_limit_respected() {
        let mut index = CapabilityIndex::new();
        for i in 0..5 {
            index
                .insert(
                    &format!("agent-{i}"),
                    &[cap("analyze", "analyze structured data tables")],
                )
                .unwrap();
        }

        let hits = index.find_by_description("analyze data tables", 3, 0.0);
        assert_eq!(hits.len(), 3);
        for (_, score) in &hits {
            assert!((0.0..=1.0).contains(score));
        }
        // Equal scores fall back to insertion order.
        assert_eq!(hits[0].0, "agent-0");
        assert_eq!(hits[1].0, "agent-1");
    }

    #[test]
    fn failing_backend_query_falls_back_to_lexical_scoring() {
        struct OfflineBackend;

        impl EmbeddingIndex for OfflineBackend {
            fn upsert(&self, _key: &str, _text: &str) -> Result<(), DiscoveryError> {
                Ok(())
            }
            fn remove(&self, _key: &str) -> Result<(), DiscoveryError> {
                Ok(())
            }
            fn query(&self, _text: &str, _k: usize) -> Result<Vec<(String, f32)>, DiscoveryError> {
                Err(DiscoveryError::Backend("index offline".into()))
            }
            fn persist(&self, _path: &Path) -> Result<(), DiscoveryError> {
                Ok(())
            }
            fn restore(&self, _path: &Path) -> Result<(), DiscoveryError> {
                Ok(())
            }
        }

        let mut index = CapabilityIndex::with_backend(Arc::new(OfflineBackend));
        index
            .insert(
                &"r1".to_string(),
                &[cap("summarize", "produce concise summaries of text")],
            )
            .unwrap();
        index
            .insert(&"r2".to_string(), &[cap("weld", "weld metal pipes")])
            .unwrap();

        let hits = index.find_by_description("concise summaries of text", 2, 0.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "r1");
    }

    #[test]
    fn min_score_filters_weak_matches() {
        let mut index = CapabilityIndex::new();
        index
            .insert(&"r1".to_string(), &[cap("summarize", "summaries of text")])
            .unwrap();
        index
            .insert(&"r2".to_string(), &[cap("weld", "weld metal pipes")])
            .unwrap();

        let hits = index.find_by_description("summaries of text", 10, 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "r1");
    }

    #[test]
    fn one_result_per_agent_even_with_many_capabilities() {
        let mut index = CapabilityIndex::new();
        index
            .insert(
                &"r1".to_string(),
                &[
                    cap("summarize", "summaries of articles"),
                    cap("digest", "short summaries of articles"),
                ],
            )
            .unwrap();

        let hits = index.find_by_description("summaries of articles", 10, 0.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "r1");
    }
}
