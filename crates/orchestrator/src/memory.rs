use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use gatehouse_core_types::{ActorId, GateError};

/// One ranked record returned by the memory service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub content: String,
    pub relevance: f32,
    pub metadata: Value,
}

/// Boundary contract for the long-term memory store. The engine only
/// consumes this interface; retrieval internals live elsewhere.
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn query(
        &self,
        actor: &ActorId,
        context: &str,
        top_k: usize,
    ) -> Result<Vec<MemorySnippet>, GateError>;

    async fn store(
        &self,
        actor: &ActorId,
        content: String,
        metadata: Value,
    ) -> Result<String, GateError>;
}

/// Memory service that remembers nothing; used when no store is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMemoryService;

impl NoopMemoryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl MemoryService for NoopMemoryService {
    async fn query(
        &self,
        _actor: &ActorId,
        _context: &str,
        _top_k: usize,
    ) -> Result<Vec<MemorySnippet>, GateError> {
        Ok(Vec::new())
    }

    async fn store(
        &self,
        _actor: &ActorId,
        _content: String,
        _metadata: Value,
    ) -> Result<String, GateError> {
        Ok(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug)]
struct StoredRecord {
    content: String,
    metadata: Value,
}

/// Per-actor in-memory store with naive token-overlap ranking; enough for
/// tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryMemoryService {
    records: DashMap<ActorId, Vec<StoredRecord>>,
}

impl InMemoryMemoryService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    async fn query(
        &self,
        actor: &ActorId,
        context: &str,
        top_k: usize,
    ) -> Result<Vec<MemorySnippet>, GateError> {
        let needle: Vec<String> = context
            .to_ascii_lowercase()
            .split_whitespace()
            .map(|token| token.to_string())
            .collect();
        let mut scored: Vec<MemorySnippet> = self
            .records
            .get(actor)
            .map(|records| {
                records
                    .iter()
                    .map(|record| {
                        let haystack = record.content.to_ascii_lowercase();
                        let hits = needle
                            .iter()
                            .filter(|token| haystack.contains(token.as_str()))
                            .count();
                        let relevance = if needle.is_empty() {
                            0.0
                        } else {
                            hits as f32 / needle.len() as f32
                        };
                        MemorySnippet {
                            content: record.content.clone(),
                            relevance,
                            metadata: record.metadata.clone(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        scored.retain(|snippet| snippet.relevance > 0.0);
        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn store(
        &self,
        actor: &ActorId,
        content: String,
        metadata: Value,
    ) -> Result<String, GateError> {
        let id = Uuid::new_v4().to_string();
        self.records
            .entry(actor.clone())
            .or_default()
            .push(StoredRecord { content, metadata });
        Ok(id)
    }
}
