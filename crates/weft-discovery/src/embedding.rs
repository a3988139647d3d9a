//! Embedding backend seam for semantic capability search.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::lexical::tokenize;
use crate::DiscoveryError;

/// A pluggable vector index over capability descriptions.
///
/// Keys are opaque to the backend (the wrapper uses description hashes).
/// Implementations synchronize internally; all methods take `&self`.
pub trait EmbeddingIndex: Send + Sync {
    /// Inserts or replaces the text behind a key.
    fn upsert(&self, key: &str, text: &str) -> Result<(), DiscoveryError>;

    /// Removes a key. Unknown keys are ignored.
    fn remove(&self, key: &str) -> Result<(), DiscoveryError>;

    /// Returns up to `k` keys with raw similarity scores, best first.
    fn query(&self, text: &str, k: usize) -> Result<Vec<(String, f32)>, DiscoveryError>;

    /// Persists the index state to a file.
    fn persist(&self, path: &Path) -> Result<(), DiscoveryError>;

    /// Restores the index state from a file, replacing current contents.
    fn restore(&self, path: &Path) -> Result<(), DiscoveryError>;
}

/// A bag-of-words embedding index.
///
/// Embeds texts as L2-normalized term-frequency vectors over a vocabulary
/// rebuilt from the stored corpus, and scores queries by cosine similarity.
/// No external model; suitable for tests and small fabrics where an ML
/// backend is not worth carrying.
#[derive(Default)]
pub struct BagOfWordsIndex {
    texts: Mutex<HashMap<String, String>>,
}

impl BagOfWordsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.texts.lock().expect("bag-of-words lock").len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EmbeddingIndex for BagOfWordsIndex {
    fn upsert(&self, key: &str, text: &str) -> Result<(), DiscoveryError> {
        self.texts
            .lock()
            .expect("bag-of-words lock")
            .insert(key.to_string(), text.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), DiscoveryError> {
        self.texts.lock().expect("bag-of-words lock").remove(key);
        Ok(())
    }

    fn query(&self, text: &str, k: usize) -> Result<Vec<(String, f32)>, DiscoveryError> {
        let texts = self.texts.lock().expect("bag-of-words lock");
        if texts.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // Vocabulary over the stored corpus plus the query, so query-only
        // terms still contribute to the query vector's norm.
        let mut vocab: HashMap<String, usize> = HashMap::new();
        for stored in texts.values().map(String::as_str).chain([text]) {
            for token in tokenize(stored) {
                let next = vocab.len();
                vocab.entry(token).or_insert(next);
            }
        }

        let query_vec = embed(text, &vocab);
        let mut hits: Vec<(String, f32)> = texts
            .iter()
            .map(|(key, stored)| {
                let score = cosine_similarity(&query_vec, &embed(stored, &vocab));
                (key.clone(), score)
            })
            .collect();

        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    fn persist(&self, path: &Path) -> Result<(), DiscoveryError> {
        let texts = self.texts.lock().expect("bag-of-words lock");
        // BTreeMap gives a stable file layout.
        let snapshot: BTreeMap<&String, &String> = texts.iter().collect();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn restore(&self, path: &Path) -> Result<(), DiscoveryError> {
        let bytes = std::fs::read(path)?;
        let snapshot: HashMap<String, String> = serde_json::from_slice(&bytes)?;
        *self.texts.lock().expect("bag-of-words lock") = snapshot;
        Ok(())
    }
}

/// Embeds a text into the given vocabulary space, L2-normalized.
fn embed(text: &str, vocab: &HashMap<String, usize>) -> Vec<f32> {
    let mut vec = vec![0.0f32; vocab.len()];
    for token in tokenize(text) {
        if let Some(&idx) = vocab.get(&token) {
            vec[idx] += 1.0;
        }
    }
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

/// Cosine similarity between two equal-dimension vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_scores_highest() {
        let index = BagOfWordsIndex::new();
        index.upsert("k1", "produce concise summaries").unwrap();
        index.upsert("k2", "translate documents").unwrap();

        let hits = index.query("produce concise summaries", 2).unwrap();
        assert_eq!(hits[0].0, "k1");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert!(hits[1].1 < hits[0].1);
    }

    #[test]
    fn disjoint_text_scores_zero() {
        let index = BagOfWordsIndex::new();
        index.upsert("k1", "weld metal pipes").unwrap();

        let hits = index.query("compose orchestral music", 1).unwrap();
        assert!(hits[0].1.abs() < 1e-5);
    }

    #[test]
    fn removed_keys_disappear_from_results() {
        let index = BagOfWordsIndex::new();
        index.upsert("k1", "summaries of text").unwrap();
        index.remove("k1").unwrap();
        assert!(index.query("summaries", 5).unwrap().is_empty());
        // removing again is fine
        index.remove("k1").unwrap();
    }

    #[test]
    fn query_respects_k() {
        let index = BagOfWordsIndex::new();
        for i in 0..10 {
            index.upsert(&format!("k{i}"), "analyze data tables").unwrap();
        }
        assert_eq!(index.query("analyze data", 3).unwrap().len(), 3);
    }

    #[test]
    fn persist_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = BagOfWordsIndex::new();
        index.upsert("k1", "produce concise summaries").unwrap();
        index.upsert("k2", "translate documents").unwrap();
        index.persist(&path).unwrap();

        let restored = BagOfWordsIndex::new();
        restored.restore(&path).unwrap();
        assert_eq!(restored.len(), 2);
        let hits = restored.query("concise summaries", 1).unwrap();
        assert_eq!(hits[0].0, "k1");
    }
}
