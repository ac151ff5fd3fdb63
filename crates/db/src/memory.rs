//! In-memory [`GraphStore`] implementation.
//!
//! Everything lives in maps behind a single `tokio::sync::RwLock`. Vector
//! search is brute-force cosine similarity; traversal is a breadth-first
//! walk over the relationship set treated as undirected.

use crate::cluster::{detect_communities, EntityGraph};
use crate::store::{
    cosine_similarity, hop_distances, sort_by_score_desc, EntityDocumentMatch, GraphStore, Store,
};
use crate::Result;
use async_trait::async_trait;
use graphkb_core::{
    ClusterMember, Community, CommunityAlgorithm, Document, Entity, RawCommunity, Relationship,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

type RelationshipKey = (String, String, String);

#[derive(Default)]
struct Inner {
    /// Documents in first-insertion order
    documents: Vec<Document>,
    document_index: HashMap<String, usize>,

    /// Entities keyed by canonical name
    entities: BTreeMap<String, Entity>,

    /// entity key -> document id -> mention count
    mentions: BTreeMap<String, BTreeMap<String, u64>>,

    relationships: BTreeMap<RelationshipKey, Relationship>,

    communities: BTreeMap<String, Community>,
}

impl Inner {
    fn nearest_entity_keys(&self, query: &[f32], limit: usize) -> Vec<String> {
        let mut scored: Vec<(f32, String)> = self
            .entities
            .iter()
            .filter_map(|(key, entity)| {
                entity
                    .embedding
                    .as_deref()
                    .map(|e| (cosine_similarity(query, e), key.clone()))
            })
            .collect();
        sort_by_score_desc(&mut scored);
        scored.into_iter().take(limit).map(|(_, key)| key).collect()
    }

    fn relationship_edges(&self) -> Vec<(String, String)> {
        self.relationships
            .keys()
            .map(|(source, target, _)| (source.clone(), target.clone()))
            .collect()
    }
}

/// Graph-capable store held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub async fn document_count(&self) -> usize {
        self.inner.read().await.documents.len()
    }

    /// All stored entities, ordered by canonical name
    pub async fn entities(&self) -> Vec<Entity> {
        self.inner.read().await.entities.values().cloned().collect()
    }

    /// All stored relationships
    pub async fn relationships(&self) -> Vec<Relationship> {
        self.inner.read().await.relationships.values().cloned().collect()
    }

    /// All stored communities, ordered by id
    pub async fn communities(&self) -> Vec<Community> {
        self.inner.read().await.communities.values().cloned().collect()
    }

    /// How many times `entity_name` was recorded as mentioned in `document_id`
    pub async fn mention_count(&self, document_id: &str, entity_name: &str) -> u64 {
        self.inner
            .read()
            .await
            .mentions
            .get(&Entity::canonicalize(entity_name))
            .and_then(|docs| docs.get(document_id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    async fn add_documents(&self, documents: &[Document]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for doc in documents {
            let mut stored = doc.clone();
            stored.score = None;
            match inner.document_index.get(&doc.id).copied() {
                Some(pos) => inner.documents[pos] = stored,
                None => {
                    let pos = inner.documents.len();
                    inner.document_index.insert(doc.id.clone(), pos);
                    inner.documents.push(stored);
                }
            }
        }
        Ok(())
    }

    async fn search_documents(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let mut scored: Vec<(f32, &Document)> = inner
            .documents
            .iter()
            .filter_map(|doc| {
                doc.embedding
                    .as_deref()
                    .map(|e| (cosine_similarity(query_embedding, e), doc))
            })
            .filter(|(score, _)| threshold.map_or(true, |t| *score >= t))
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| doc.clone().with_score(score))
            .collect())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn add_entities(&self, entities: &[Entity], document_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        for entity in entities {
            let key = entity.key();
            match inner.entities.get_mut(&key) {
                Some(existing) => {
                    if entity.description.len() > existing.description.len() {
                        existing.description = entity.description.clone();
                        existing.entity_type = entity.entity_type;
                    }
                    if entity.embedding.is_some() {
                        existing.embedding = entity.embedding.clone();
                    }
                }
                None => {
                    inner.entities.insert(key.clone(), entity.clone());
                }
            }

            *inner
                .mentions
                .entry(key)
                .or_default()
                .entry(document_id.to_string())
                .or_insert(0) += 1;
        }
        Ok(())
    }

    #[instrument(skip(self, relationships), fields(count = relationships.len()))]
    async fn add_relationships(&self, relationships: &[Relationship]) -> Result<()> {
        let mut inner = self.inner.write().await;
        for rel in relationships {
            match inner.relationships.get_mut(&rel.key()) {
                Some(existing) => {
                    if rel.description.len() > existing.description.len() {
                        existing.description = rel.description.clone();
                    }
                    existing.strength = existing.strength.max(rel.strength);
                }
                None => {
                    inner.relationships.insert(rel.key(), rel.clone());
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, communities), fields(count = communities.len()))]
    async fn add_communities(&self, communities: &[Community]) -> Result<()> {
        let levels: BTreeSet<u32> = communities.iter().map(|c| c.level).collect();
        let mut inner = self.inner.write().await;
        inner.communities.retain(|_, c| !levels.contains(&c.level));
        for community in communities {
            let mut stored = community.clone();
            stored.score = None;
            inner.communities.insert(stored.id.clone(), stored);
        }
        Ok(())
    }

    #[instrument(skip(self, communities), fields(count = communities.len()))]
    async fn replace_communities(&self, communities: &[Community]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.communities.clear();
        for community in communities {
            let mut stored = community.clone();
            stored.score = None;
            inner.communities.insert(stored.id.clone(), stored);
        }
        Ok(())
    }

    async fn search_entities(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<Entity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .nearest_entity_keys(query_embedding, limit)
            .iter()
            .filter_map(|key| inner.entities.get(key).cloned())
            .collect())
    }

    async fn search_communities(
        &self,
        query_embedding: &[f32],
        min_level: u32,
        limit: usize,
    ) -> Result<Vec<Community>> {
        let inner = self.inner.read().await;
        let mut scored: Vec<(f32, &Community)> = inner
            .communities
            .values()
            .filter(|c| c.level >= min_level)
            .filter_map(|c| {
                c.embedding
                    .as_deref()
                    .map(|e| (cosine_similarity(query_embedding, e), c))
            })
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, c)| {
                let mut community = c.clone();
                community.score = Some(score);
                community
            })
            .collect())
    }

    #[instrument(skip(self, seed_embedding))]
    async fn traverse_from_entities(
        &self,
        seed_embedding: &[f32],
        seed_limit: usize,
        max_hops: u32,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read().await;
        let seeds = inner.nearest_entity_keys(seed_embedding, seed_limit);
        let hops = hop_distances(&seeds, &inner.relationship_edges(), max_hops);
        debug!(seeds = seeds.len(), reached = hops.len(), "Graph traversal finished");

        let mut best: HashMap<&str, u32> = HashMap::new();
        for (key, &hop) in &hops {
            for doc_id in inner.mentions.get(key).into_iter().flat_map(|docs| docs.keys()) {
                let entry = best.entry(doc_id.as_str()).or_insert(hop);
                *entry = (*entry).min(hop);
            }
        }

        let mut scored: Vec<(f32, &Document)> = inner
            .documents
            .iter()
            .filter_map(|doc| {
                best.get(doc.id.as_str())
                    .map(|&hop| (1.0 / (hop as f32 + 1.0), doc))
            })
            .collect();
        sort_by_score_desc(&mut scored);

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, doc)| doc.clone().with_score(score))
            .collect())
    }

    async fn query_documents_by_entities(
        &self,
        entity_names: &[String],
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<EntityDocumentMatch>> {
        let inner = self.inner.read().await;
        let wanted: BTreeSet<String> = entity_names.iter().map(|n| Entity::canonicalize(n)).collect();

        // document id -> (entity names, total mentions)
        let mut per_document: HashMap<&str, (Vec<String>, u64)> = HashMap::new();
        for key in &wanted {
            let Some(docs) = inner.mentions.get(key) else {
                continue;
            };
            let name = inner
                .entities
                .get(key)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| key.clone());
            for (doc_id, count) in docs {
                let entry = per_document.entry(doc_id.as_str()).or_default();
                entry.0.push(name.clone());
                entry.1 += count;
            }
        }

        let mut matches: Vec<EntityDocumentMatch> = inner
            .documents
            .iter()
            .filter_map(|doc| {
                per_document.remove(doc.id.as_str()).map(|(names, mentions)| {
                    let similarity = doc
                        .embedding
                        .as_deref()
                        .map_or(0.0, |e| cosine_similarity(query_embedding, e));
                    EntityDocumentMatch {
                        document: doc.clone(),
                        entity_count: names.len(),
                        total_mentions: mentions,
                        mentioned_entities: names,
                        vector_similarity: similarity,
                    }
                })
            })
            .collect();
        matches.sort_by(EntityDocumentMatch::rank);
        matches.truncate(limit);
        Ok(matches)
    }

    #[instrument(skip(self))]
    async fn run_clustering(&self, algorithm: CommunityAlgorithm) -> Result<Vec<RawCommunity>> {
        let inner = self.inner.read().await;
        let mut graph = EntityGraph::new();
        for (key, entity) in &inner.entities {
            graph.add_node(
                key.clone(),
                ClusterMember {
                    name: entity.name.clone(),
                    description: entity.description.clone(),
                },
            );
        }
        for ((source, target, _), rel) in &inner.relationships {
            graph.add_edge(source, target, f64::from(rel.strength));
        }

        Ok(detect_communities(&graph, algorithm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphkb_core::EntityType;

    fn doc(id: &str, embedding: Vec<f32>) -> Document {
        Document::new(id, format!("content of {}", id)).with_embedding(embedding)
    }

    fn entity(name: &str, description: &str, embedding: Vec<f32>) -> Entity {
        Entity::new(name, EntityType::Concept, description)
            .unwrap()
            .with_embedding(embedding)
    }

    #[tokio::test]
    async fn test_search_documents_threshold_and_limit() {
        let store = MemoryStore::new();
        store
            .add_documents(&[
                doc("near", vec![1.0, 0.0]),
                doc("mid", vec![1.0, 1.0]),
                doc("far", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let all = store.search_documents(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "near");
        assert!((all[0].score.unwrap() - 1.0).abs() < 1e-6);

        let filtered = store.search_documents(&[1.0, 0.0], 10, Some(0.5)).await.unwrap();
        let ids: Vec<&str> = filtered.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);

        let limited = store.search_documents(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_reingestion_overwrites() {
        let store = MemoryStore::new();
        store.add_documents(&[doc("a", vec![1.0, 0.0])]).await.unwrap();
        store.add_documents(&[doc("a", vec![0.0, 1.0])]).await.unwrap();

        assert_eq!(store.document_count().await, 1);
        let hits = store.search_documents(&[0.0, 1.0], 1, None).await.unwrap();
        assert!((hits[0].score.unwrap() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_entity_upsert_and_mentions() {
        let store = MemoryStore::new();
        store
            .add_entities(&[entity("OpenAI", "co", vec![1.0, 0.0])], "d1")
            .await
            .unwrap();
        store
            .add_entities(&[entity("openai", "company based in SF", vec![1.0, 0.0])], "d1")
            .await
            .unwrap();

        let entities = store.entities().await;
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "OpenAI");
        assert_eq!(entities[0].description, "company based in SF");
        assert_eq!(store.mention_count("d1", "OPENAI").await, 2);
        assert_eq!(store.mention_count("d2", "OpenAI").await, 0);
    }

    #[tokio::test]
    async fn test_relationship_upsert() {
        let store = MemoryStore::new();
        let a = Relationship::new("Alice", "OpenAI", "works for", "").unwrap();
        let b = Relationship::new("alice", "openai", "WORKS_FOR", "employed as researcher").unwrap();
        store.add_relationships(&[a, b]).await.unwrap();

        let rels = store.relationships().await;
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].description, "employed as researcher");
    }

    #[tokio::test]
    async fn test_traversal_scores_by_hops() {
        let store = MemoryStore::new();
        store
            .add_documents(&[
                doc("d_alice", vec![0.0, 1.0]),
                doc("d_openai", vec![0.0, 1.0]),
                doc("d_sf", vec![0.0, 1.0]),
                doc("d_far", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();
        store
            .add_entities(&[entity("Alice", "", vec![1.0, 0.0])], "d_alice")
            .await
            .unwrap();
        store
            .add_entities(&[entity("OpenAI", "", vec![0.0, 1.0])], "d_openai")
            .await
            .unwrap();
        store
            .add_entities(&[entity("San Francisco", "", vec![0.0, 1.0])], "d_sf")
            .await
            .unwrap();
        store
            .add_entities(&[entity("Mars", "", vec![0.0, 1.0])], "d_far")
            .await
            .unwrap();
        store
            .add_relationships(&[
                Relationship::new("Alice", "OpenAI", "WORKS_FOR", "").unwrap(),
                Relationship::new("OpenAI", "San Francisco", "LOCATED_IN", "").unwrap(),
                Relationship::new("San Francisco", "Mars", "FAR_FROM", "").unwrap(),
            ])
            .await
            .unwrap();

        let docs = store
            .traverse_from_entities(&[1.0, 0.0], 1, 2, 10)
            .await
            .unwrap();
        let scored: Vec<(&str, f32)> = docs.iter().map(|d| (d.id.as_str(), d.score.unwrap())).collect();

        assert_eq!(scored.len(), 3);
        assert_eq!(scored[0], ("d_alice", 1.0));
        assert_eq!(scored[1], ("d_openai", 0.5));
        assert!((scored[2].1 - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(scored[2].0, "d_sf");
    }

    #[tokio::test]
    async fn test_communities_replace_by_level() {
        let store = MemoryStore::new();
        let raw = |cluster_id: u64, level: u32| RawCommunity {
            cluster_id,
            level,
            members: vec![ClusterMember {
                name: "Alice".into(),
                description: String::new(),
            }],
        };

        store
            .add_communities(&[Community::fallback(&raw(0, 0)), Community::fallback(&raw(1, 0))])
            .await
            .unwrap();
        store
            .add_communities(&[Community::fallback(&raw(0, 1))])
            .await
            .unwrap();
        assert_eq!(store.communities().await.len(), 3);

        store
            .add_communities(&[Community::fallback(&raw(5, 0))])
            .await
            .unwrap();
        let ids: Vec<String> = store.communities().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["comm_0_5", "comm_1_0"]);

        // a full rerun with fewer levels leaves no deeper ones behind
        store
            .replace_communities(&[Community::fallback(&raw(7, 0))])
            .await
            .unwrap();
        let ids: Vec<String> = store.communities().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["comm_0_7"]);
    }

    #[tokio::test]
    async fn test_search_communities_min_level() {
        let store = MemoryStore::new();
        let make = |cluster_id: u64, level: u32, embedding: Vec<f32>| {
            Community::fallback(&RawCommunity {
                cluster_id,
                level,
                members: Vec::new(),
            })
            .with_embedding(embedding)
        };
        store
            .add_communities(&[make(0, 0, vec![1.0, 0.0]), make(0, 1, vec![0.5, 0.5])])
            .await
            .unwrap();

        let all = store.search_communities(&[1.0, 0.0], 0, 5).await.unwrap();
        assert_eq!(all[0].id, "comm_0_0");
        assert!(all[0].score.is_some());

        let upper = store.search_communities(&[1.0, 0.0], 1, 5).await.unwrap();
        assert_eq!(upper.len(), 1);
        assert_eq!(upper[0].level, 1);
    }

    #[tokio::test]
    async fn test_query_documents_by_entities() {
        let store = MemoryStore::new();
        store
            .add_documents(&[doc("d1", vec![1.0, 0.0]), doc("d2", vec![0.0, 1.0])])
            .await
            .unwrap();
        store
            .add_entities(&[entity("Alice", "", vec![1.0, 0.0]), entity("Bob", "", vec![0.0, 1.0])], "d1")
            .await
            .unwrap();
        store
            .add_entities(&[entity("Alice", "", vec![1.0, 0.0])], "d2")
            .await
            .unwrap();
        store
            .add_entities(&[entity("Alice", "", vec![1.0, 0.0])], "d2")
            .await
            .unwrap();

        let matches = store
            .query_documents_by_entities(&["alice".into(), "BOB".into()], &[0.0, 1.0], 10)
            .await
            .unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].document.id, "d2");
        assert_eq!(matches[0].entity_count, 1);
        assert_eq!(matches[0].total_mentions, 2);
        assert_eq!(matches[1].document.id, "d1");
        assert_eq!(matches[1].entity_count, 2);
        assert_eq!(matches[1].mentioned_entities, vec!["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_run_clustering_over_stored_graph() {
        let store = MemoryStore::new();
        store
            .add_entities(
                &[
                    entity("Alice", "", vec![1.0, 0.0]),
                    entity("OpenAI", "", vec![1.0, 0.0]),
                    entity("Loner", "", vec![1.0, 0.0]),
                ],
                "d1",
            )
            .await
            .unwrap();
        store
            .add_relationships(&[Relationship::new("Alice", "OpenAI", "WORKS_FOR", "").unwrap()])
            .await
            .unwrap();

        let raw = store.run_clustering(CommunityAlgorithm::Leiden).await.unwrap();
        let level0: Vec<Vec<String>> = raw
            .iter()
            .filter(|c| c.level == 0)
            .map(|c| c.member_names())
            .collect();
        assert!(level0.contains(&vec!["Loner".to_string()]));
        assert!(level0
            .iter()
            .any(|names| names.contains(&"Alice".to_string()) && names.contains(&"OpenAI".to_string())));
    }
}
