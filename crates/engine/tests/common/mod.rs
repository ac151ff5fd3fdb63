//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use graphkb_core::{CommunityAlgorithm, Community, Document, Entity, RawCommunity, Relationship};
use graphkb_db::{EntityDocumentMatch, GraphStore, MemoryStore, Store};
use graphkb_engine::{EngineError, Embedder, Generator, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const DIMENSION: usize = 4096;

/// Bag-of-prefixes embedder: lowercase tokens, first four characters,
/// hashed into a fixed number of buckets and normalized
pub struct HashEmbedder;

fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf29ce484222325u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x100000001b3)
    })
}

pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; DIMENSION];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let prefix: String = token.chars().take(4).collect();
        vector[(fnv1a(&prefix) % DIMENSION as u64) as usize] += 1.0;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

/// The document text a prompt was built for
pub fn prompt_text(prompt: &str) -> &str {
    prompt.rsplit("Text:\n").next().unwrap_or("")
}

type Script = dyn Fn(&str) -> Result<String> + Send + Sync;

/// Generator answering through a closure, counting calls
pub struct ScriptedGenerator {
    script: Box<Script>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: impl Fn(&str) -> Result<String> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(prompt)
    }
}

/// Generator that never answers in time
pub struct StalledGenerator;

#[async_trait]
impl Generator for StalledGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok("[]".into())
    }
}

pub const ALICE_DOC: &str = "Alice works at OpenAI as a researcher.";
pub const BOB_DOC: &str = "Bob collaborates with Alice on transformer research.";

/// Answers for the two-document Alice/Bob scenario
pub fn scenario_response(prompt: &str) -> Result<String> {
    let text = prompt_text(prompt);
    if prompt.starts_with("Summarize the following group") {
        return Ok(r#"{"title": "Research group", "summary": "People doing AI research together."}"#.into());
    }
    if prompt.contains("Known entities:") {
        if text.contains("OpenAI") {
            return Ok(r#"[{"source": "Alice", "target": "OpenAI", "type": "works for", "description": "Alice is employed by OpenAI"}]"#.into());
        }
        return Ok(r#"[{"source": "Bob", "target": "alice", "type": "collaborates with", "description": "research partners"}]"#.into());
    }
    if prompt.contains("You already extracted") {
        return Ok("[]".into());
    }
    if text.contains("OpenAI") {
        return Ok(r#"```json
[{"name": "Alice", "type": "PERSON", "description": "researcher"},
 {"name": "OpenAI", "type": "ORG", "description": "AI lab"}]
```"#
            .into());
    }
    if text.contains("Bob") {
        return Ok(r#"Here you go: [{"name": "Bob", "type": "PERSON", "description": "collaborator"},
 {"name": "alice", "type": "PERSON", "description": "transformer researcher"}]"#
            .into());
    }
    Ok("[]".into())
}

/// Memory store with switchable faults
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_traversal: bool,
    pub hide_communities: bool,
    pub fail_clustering: bool,
    /// Document whose entity write is held back
    pub slow_entities_for: Option<String>,
}

pub const SLOW_WRITE: std::time::Duration = std::time::Duration::from_millis(500);

fn injected(what: &str) -> graphkb_db::DbError {
    graphkb_db::DbError::Connection(format!("injected {} failure", what))
}

#[async_trait]
impl Store for FaultyStore {
    async fn add_documents(&self, documents: &[Document]) -> graphkb_db::Result<()> {
        self.inner.add_documents(documents).await
    }

    async fn search_documents(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> graphkb_db::Result<Vec<Document>> {
        self.inner
            .search_documents(query_embedding, limit, threshold)
            .await
    }
}

#[async_trait]
impl GraphStore for FaultyStore {
    async fn add_entities(&self, entities: &[Entity], document_id: &str) -> graphkb_db::Result<()> {
        if self.slow_entities_for.as_deref() == Some(document_id) {
            tokio::time::sleep(SLOW_WRITE).await;
        }
        self.inner.add_entities(entities, document_id).await
    }

    async fn add_relationships(&self, relationships: &[Relationship]) -> graphkb_db::Result<()> {
        self.inner.add_relationships(relationships).await
    }

    async fn add_communities(&self, communities: &[Community]) -> graphkb_db::Result<()> {
        self.inner.add_communities(communities).await
    }

    async fn replace_communities(&self, communities: &[Community]) -> graphkb_db::Result<()> {
        self.inner.replace_communities(communities).await
    }

    async fn search_entities(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> graphkb_db::Result<Vec<Entity>> {
        self.inner.search_entities(query_embedding, limit).await
    }

    async fn search_communities(
        &self,
        query_embedding: &[f32],
        min_level: u32,
        limit: usize,
    ) -> graphkb_db::Result<Vec<Community>> {
        if self.hide_communities {
            return Ok(Vec::new());
        }
        self.inner
            .search_communities(query_embedding, min_level, limit)
            .await
    }

    async fn traverse_from_entities(
        &self,
        seed_embedding: &[f32],
        seed_limit: usize,
        max_hops: u32,
        limit: usize,
    ) -> graphkb_db::Result<Vec<Document>> {
        if self.fail_traversal {
            return Err(injected("traversal"));
        }
        self.inner
            .traverse_from_entities(seed_embedding, seed_limit, max_hops, limit)
            .await
    }

    async fn query_documents_by_entities(
        &self,
        entity_names: &[String],
        query_embedding: &[f32],
        limit: usize,
    ) -> graphkb_db::Result<Vec<EntityDocumentMatch>> {
        self.inner
            .query_documents_by_entities(entity_names, query_embedding, limit)
            .await
    }

    async fn run_clustering(
        &self,
        algorithm: CommunityAlgorithm,
    ) -> graphkb_db::Result<Vec<RawCommunity>> {
        if self.fail_clustering {
            return Err(injected("clustering"));
        }
        self.inner.run_clustering(algorithm).await
    }
}

/// A store with no graph capability at all
#[derive(Default)]
pub struct VectorOnlyStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl Store for VectorOnlyStore {
    async fn add_documents(&self, documents: &[Document]) -> graphkb_db::Result<()> {
        self.inner.add_documents(documents).await
    }

    async fn search_documents(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> graphkb_db::Result<Vec<Document>> {
        self.inner
            .search_documents(query_embedding, limit, threshold)
            .await
    }
}

pub fn scenario_documents() -> Vec<Document> {
    vec![Document::new("d1", ALICE_DOC), Document::new("d2", BOB_DOC)]
}

pub fn assert_configuration_error<T>(result: Result<T>) {
    match result {
        Err(EngineError::Configuration(_)) => {}
        Err(other) => panic!("expected a configuration error, got {}", other),
        Ok(_) => panic!("expected a configuration error, got success"),
    }
}
