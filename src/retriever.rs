use crate::store::{Chunk, DocumentStore};
use std::collections::HashSet;
use tracing::debug;

pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a Chunk,
    pub score: usize,
}

/// Ranks stored chunks by how many distinct query words they contain.
#[derive(Debug, Clone)]
pub struct ContextRetriever {
    top_k: usize,
    skip_zero_scores: bool,
}

impl Default for ContextRetriever {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

impl ContextRetriever {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            skip_zero_scores: false,
        }
    }

    /// Drop chunks that share no word with the query. Off by default, in which
    /// case the first `top_k` chunks are returned even when nothing matches.
    pub fn with_skip_zero_scores(mut self, skip: bool) -> Self {
        self.skip_zero_scores = skip;
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Score every chunk and keep the best `top_k`. Ties keep store order.
    pub fn search<'a>(
        &self,
        store: &'a DocumentStore,
        query: &str,
        top_k: usize,
    ) -> Vec<ScoredChunk<'a>> {
        let query_terms = term_set(query);
        let mut scored: Vec<ScoredChunk<'a>> = store
            .chunks()
            .map(|chunk| ScoredChunk {
                chunk,
                score: overlap_score(&query_terms, &chunk.content),
            })
            .filter(|s| !self.skip_zero_scores || s.score > 0)
            .collect();

        // sort_by is stable
        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored.truncate(top_k);
        scored
    }

    pub fn retrieve(&self, store: &DocumentStore, query: &str) -> String {
        self.retrieve_top_k(store, query, self.top_k)
    }

    /// Best chunks joined by blank lines; empty when nothing is stored.
    pub fn retrieve_top_k(&self, store: &DocumentStore, query: &str, top_k: usize) -> String {
        let results = self.search(store, query, top_k);
        debug!(
            chunks = results.len(),
            best_score = results.first().map(|s| s.score).unwrap_or(0),
            "retrieved context"
        );
        results
            .iter()
            .map(|s| s.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Distinct lowercase whitespace-separated words.
pub fn term_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

/// Number of query words that also occur in `text`.
pub fn overlap_score(query_terms: &HashSet<String>, text: &str) -> usize {
    term_set(text).intersection(query_terms).count()
}
