//! Lexical fallback scoring for degraded-mode semantic search.

use std::collections::BTreeSet;

/// Tokenizes text into lowercase words, stripping punctuation.
/// Single-character tokens are skipped.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Whether two tokens count as overlapping.
///
/// Exact equality, or a shared prefix of at least four characters covering at
/// least two thirds of the shorter token. The prefix rule lets inflected
/// forms ("summary" / "summaries") overlap without a stemmer.
fn tokens_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let prefix = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    let shorter = a.len().min(b.len());
    prefix >= 4 && prefix * 3 >= shorter * 2
}

/// Scores a query against a capability text with substring-and-token-overlap
/// matching. Returns a similarity in [0, 1].
///
/// The base score is a fuzzy Jaccard: matched query tokens over the union of
/// both token sets. Full containment of one text in the other lifts the score
/// to at least 0.9.
pub fn lexical_score(query: &str, text: &str) -> f32 {
    let query_tokens: BTreeSet<String> = tokenize(query).into_iter().collect();
    let text_tokens: BTreeSet<String> = tokenize(text).into_iter().collect();
    if query_tokens.is_empty() || text_tokens.is_empty() {
        return 0.0;
    }

    let matched = query_tokens
        .iter()
        .filter(|q| text_tokens.iter().any(|t| tokens_match(q, t)))
        .count();
    let union = query_tokens.len() + text_tokens.len() - matched;
    let mut score = matched as f32 / union as f32;

    let query_lower = query.to_lowercase();
    let text_lower = text.to_lowercase();
    if text_lower.contains(query_lower.trim()) || query_lower.contains(text_lower.trim()) {
        score = score.max(0.9);
    }

    score.clamp(0.0, 1.0)
}
