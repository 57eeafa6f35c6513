//! In-memory retrieval store
//!
//! Deterministic token-overlap scoring over an in-process corpus. The real
//! similarity store is an external collaborator behind the [`Retriever`]
//! trait; this implementation backs single-process deployments and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use runway_core::RetrievedChunk;
use serde_json::json;

use crate::collab::{RetrievalError, Retriever};

struct StoredChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    tokens: HashSet<String>,
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Keyword-overlap retrieval over documents added at ingestion time.
pub struct InMemoryRetriever {
    chunks: RwLock<Vec<StoredChunk>>,
}

impl InMemoryRetriever {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Ingest a document, one chunk per paragraph.
    pub fn add_document(&self, document_id: &str, text: &str) {
        let mut chunks = self.chunks.write();
        for (index, paragraph) in text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
        {
            chunks.push(StoredChunk {
                chunk_id: format!("{document_id}-c{index}"),
                document_id: document_id.to_string(),
                text: paragraph.to_string(),
                tokens: tokenize(paragraph),
            });
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }
}

impl Default for InMemoryRetriever {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn query(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let chunks = self.chunks.read();
        let mut scored: Vec<(f64, &StoredChunk)> = chunks
            .iter()
            .filter_map(|chunk| {
                let overlap = chunk.tokens.intersection(&query_tokens).count();
                if overlap == 0 {
                    return None;
                }
                let score = overlap as f64 / (chunk.tokens.len().max(1) as f64).sqrt();
                Some((score, chunk))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, chunk)| RetrievedChunk {
                chunk_id: chunk.chunk_id.clone(),
                document_id: chunk.document_id.clone(),
                score,
                metadata: json!({}),
                text: chunk.text.clone(),
            })
            .collect())
    }
}
