//! SurrealDB-backed [`GraphStore`]

use crate::cluster::{detect_communities, EntityGraph};
use crate::store::{cosine_similarity, hop_distances, EntityDocumentMatch, GraphStore, Store};
use crate::{DbConnection, Result};
use async_trait::async_trait;
use graphkb_core::{
    ClusterMember, Community, CommunityAlgorithm, DocMetadata, Document, Entity, EntityType,
    RawCommunity, Relationship,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, instrument};

/// Store operations backed by an embedded SurrealDB
#[derive(Clone)]
pub struct SurrealStore {
    db: DbConnection,
}

impl SurrealStore {
    /// Wrap an initialized connection (see [`crate::init_memory`])
    pub fn new(db: DbConnection) -> Self {
        Self { db }
    }

    // ==========================================
    // DOCUMENT HELPERS
    // ==========================================

    async fn documents_by_key(&self, keys: Vec<String>) -> Result<Vec<DocumentRow>> {
        let rows: Vec<DocumentRow> = self
            .db
            .query("SELECT key, embedding, metadata FROM document WHERE key INSIDE $keys")
            .bind(("keys", keys))
            .await?
            .take(0)?;
        Ok(rows)
    }

    // ==========================================
    // ENTITY HELPERS
    // ==========================================

    async fn nearest_entities(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<EntityHit>> {
        let hits: Vec<EntityHit> = self
            .db
            .query(
                r#"
                SELECT
                    key,
                    name,
                    entity_type,
                    description,
                    embedding,
                    vector::similarity::cosine(embedding, $embedding) AS score
                FROM entity
                WHERE
                    embedding IS NOT NONE AND
                    array::len(embedding) = $dimension
                ORDER BY score DESC
                LIMIT $limit
            "#,
            )
            .bind(("embedding", query_embedding.to_vec()))
            .bind(("dimension", query_embedding.len()))
            .bind(("limit", limit))
            .await?
            .take(0)?;
        Ok(hits)
    }

    async fn relation_edges(&self) -> Result<Vec<RelationEdge>> {
        let edges: Vec<RelationEdge> = self
            .db
            .query("SELECT source_key, target_key, strength FROM relation")
            .await?
            .take(0)?;
        Ok(edges)
    }

    async fn mentions_of(&self, entity_keys: Vec<String>) -> Result<Vec<MentionRow>> {
        let rows: Vec<MentionRow> = self
            .db
            .query("SELECT document, entity, count FROM mention WHERE entity INSIDE $keys")
            .bind(("keys", entity_keys))
            .await?
            .take(0)?;
        Ok(rows)
    }
}

#[async_trait]
impl Store for SurrealStore {
    #[instrument(skip(self, documents), fields(count = documents.len()))]
    async fn add_documents(&self, documents: &[Document]) -> Result<()> {
        for doc in documents {
            self.db
                .query("UPSERT type::thing('document', $key) CONTENT $row")
                .bind(("key", doc.id.clone()))
                .bind((
                    "row",
                    DocumentRow {
                        key: doc.id.clone(),
                        embedding: doc.embedding.clone(),
                        metadata: doc.metadata.clone(),
                    },
                ))
                .await?
                .check()?;
        }
        Ok(())
    }

    #[instrument(skip(self, query_embedding))]
    async fn search_documents(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<Document>> {
        let hits: Vec<ScoredDocument> = self
            .db
            .query(
                r#"
                SELECT
                    key,
                    embedding,
                    metadata,
                    vector::similarity::cosine(embedding, $embedding) AS score
                FROM document
                WHERE
                    embedding IS NOT NONE AND
                    array::len(embedding) = $dimension
                ORDER BY score DESC
                LIMIT $limit
            "#,
            )
            .bind(("embedding", query_embedding.to_vec()))
            .bind(("dimension", query_embedding.len()))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        // rows are ordered by score, so filtering after the limit is equivalent
        Ok(hits
            .into_iter()
            .filter(|hit| threshold.map_or(true, |t| hit.score >= t))
            .map(ScoredDocument::into_document)
            .collect())
    }
}

#[async_trait]
impl GraphStore for SurrealStore {
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    async fn add_entities(&self, entities: &[Entity], document_id: &str) -> Result<()> {
        for entity in entities {
            let key = entity.key();
            self.db
                .query(
                    r#"
                    UPSERT type::thing('entity', $key) SET
                        key = $key,
                        name = name OR $name,
                        entity_type = IF entity_type IS NONE OR string::len(description OR '') < string::len($description)
                            THEN $entity_type ELSE entity_type END,
                        description = IF string::len(description OR '') < string::len($description)
                            THEN $description ELSE description OR '' END,
                        embedding = $embedding OR embedding;
                    UPSERT type::thing('mention', [$document, $key]) SET
                        document = $document,
                        entity = $key,
                        count = (count OR 0) + 1;
                "#,
                )
                .bind(("key", key))
                .bind(("name", entity.name.clone()))
                .bind(("entity_type", entity.entity_type))
                .bind(("description", entity.description.clone()))
                .bind(("embedding", entity.embedding.clone()))
                .bind(("document", document_id.to_string()))
                .await?
                .check()?;
        }
        Ok(())
    }

    #[instrument(skip(self, relationships), fields(count = relationships.len()))]
    async fn add_relationships(&self, relationships: &[Relationship]) -> Result<()> {
        for rel in relationships {
            let (source_key, target_key, relation_type) = rel.key();
            self.db
                .query(
                    r#"
                    UPSERT type::thing('relation', [$source_key, $target_key, $relation_type]) SET
                        source = source OR $source,
                        target = target OR $target,
                        source_key = $source_key,
                        target_key = $target_key,
                        relation_type = $relation_type,
                        description = IF string::len(description OR '') < string::len($description)
                            THEN $description ELSE description OR '' END,
                        strength = math::max([strength OR 0, $strength]);
                "#,
                )
                .bind(("source", rel.source.clone()))
                .bind(("target", rel.target.clone()))
                .bind(("source_key", source_key))
                .bind(("target_key", target_key))
                .bind(("relation_type", relation_type))
                .bind(("description", rel.description.clone()))
                .bind(("strength", rel.strength))
                .await?
                .check()?;
        }
        Ok(())
    }

    #[instrument(skip(self, communities), fields(count = communities.len()))]
    async fn add_communities(&self, communities: &[Community]) -> Result<()> {
        let levels: Vec<u32> = communities
            .iter()
            .map(|c| c.level)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let rows: Vec<Community> = communities
            .iter()
            .cloned()
            .map(|mut c| {
                c.score = None;
                c
            })
            .collect();

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE community WHERE level INSIDE $levels;
                INSERT INTO community $rows;
                COMMIT TRANSACTION;
            "#,
            )
            .bind(("levels", levels))
            .bind(("rows", rows))
            .await?
            .check()?;
        Ok(())
    }

    #[instrument(skip(self, communities), fields(count = communities.len()))]
    async fn replace_communities(&self, communities: &[Community]) -> Result<()> {
        let rows: Vec<Community> = communities
            .iter()
            .cloned()
            .map(|mut c| {
                c.score = None;
                c
            })
            .collect();

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE community;
                INSERT INTO community $rows;
                COMMIT TRANSACTION;
            "#,
            )
            .bind(("rows", rows))
            .await?
            .check()?;
        Ok(())
    }

    async fn search_entities(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<Entity>> {
        let hits = self.nearest_entities(query_embedding, limit).await?;
        Ok(hits.into_iter().map(EntityHit::into_entity).collect())
    }

    #[instrument(skip(self, query_embedding))]
    async fn search_communities(
        &self,
        query_embedding: &[f32],
        min_level: u32,
        limit: usize,
    ) -> Result<Vec<Community>> {
        let hits: Vec<Community> = self
            .db
            .query(
                r#"
                SELECT
                    record::id(id) AS id,
                    level,
                    title,
                    summary,
                    rating,
                    entity_count,
                    entity_ids,
                    embedding,
                    vector::similarity::cosine(embedding, $embedding) AS score
                FROM community
                WHERE
                    level >= $min_level AND
                    embedding IS NOT NONE AND
                    array::len(embedding) = $dimension
                ORDER BY score DESC
                LIMIT $limit
            "#,
            )
            .bind(("embedding", query_embedding.to_vec()))
            .bind(("dimension", query_embedding.len()))
            .bind(("min_level", min_level))
            .bind(("limit", limit))
            .await?
            .take(0)?;
        Ok(hits)
    }

    #[instrument(skip(self, seed_embedding))]
    async fn traverse_from_entities(
        &self,
        seed_embedding: &[f32],
        seed_limit: usize,
        max_hops: u32,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let seeds: Vec<String> = self
            .nearest_entities(seed_embedding, seed_limit)
            .await?
            .into_iter()
            .map(|hit| hit.key)
            .collect();
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let edges: Vec<(String, String)> = self
            .relation_edges()
            .await?
            .into_iter()
            .map(|e| (e.source_key, e.target_key))
            .collect();
        let hops = hop_distances(&seeds, &edges, max_hops);
        debug!(seeds = seeds.len(), reached = hops.len(), "Graph traversal finished");

        let mut best: HashMap<String, u32> = HashMap::new();
        for mention in self.mentions_of(hops.keys().cloned().collect()).await? {
            if let Some(&hop) = hops.get(&mention.entity) {
                let entry = best.entry(mention.document).or_insert(hop);
                *entry = (*entry).min(hop);
            }
        }

        let mut documents: Vec<Document> = self
            .documents_by_key(best.keys().cloned().collect())
            .await?
            .into_iter()
            .filter_map(|row| {
                let hop = *best.get(&row.key)?;
                Some(row.into_document().with_score(1.0 / (hop as f32 + 1.0)))
            })
            .collect();
        documents.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        documents.truncate(limit);
        Ok(documents)
    }

    #[instrument(skip(self, entity_names, query_embedding))]
    async fn query_documents_by_entities(
        &self,
        entity_names: &[String],
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<EntityDocumentMatch>> {
        let keys: Vec<String> = entity_names
            .iter()
            .map(|n| Entity::canonicalize(n))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let names: HashMap<String, String> = {
            let rows: Vec<EntityName> = self
                .db
                .query("SELECT key, name FROM entity WHERE key INSIDE $keys")
                .bind(("keys", keys.clone()))
                .await?
                .take(0)?;
            rows.into_iter().map(|r| (r.key, r.name)).collect()
        };

        // document key -> entity key -> mention count
        let mut per_document: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for mention in self.mentions_of(keys).await? {
            *per_document
                .entry(mention.document)
                .or_default()
                .entry(mention.entity)
                .or_insert(0) += mention.count;
        }

        let rows = self
            .documents_by_key(per_document.keys().cloned().collect())
            .await?;
        let mut matches: Vec<EntityDocumentMatch> = rows
            .into_iter()
            .filter_map(|row| {
                let mentioned = per_document.get(&row.key)?;
                let similarity = row
                    .embedding
                    .as_deref()
                    .map_or(0.0, |e| cosine_similarity(query_embedding, e));
                Some(EntityDocumentMatch {
                    entity_count: mentioned.len(),
                    total_mentions: mentioned.values().sum(),
                    mentioned_entities: mentioned
                        .keys()
                        .map(|k| names.get(k).cloned().unwrap_or_else(|| k.clone()))
                        .collect(),
                    vector_similarity: similarity,
                    document: row.into_document(),
                })
            })
            .collect();
        matches.sort_by(EntityDocumentMatch::rank);
        matches.truncate(limit);
        Ok(matches)
    }

    #[instrument(skip(self))]
    async fn run_clustering(&self, algorithm: CommunityAlgorithm) -> Result<Vec<RawCommunity>> {
        let nodes: Vec<EntityNode> = self
            .db
            .query("SELECT key, name, description FROM entity ORDER BY key")
            .await?
            .take(0)?;

        let mut graph = EntityGraph::new();
        for node in nodes {
            graph.add_node(
                node.key,
                ClusterMember {
                    name: node.name,
                    description: node.description,
                },
            );
        }
        for edge in self.relation_edges().await? {
            graph.add_edge(&edge.source_key, &edge.target_key, edge.strength);
        }
        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Loaded entity graph"
        );

        Ok(detect_communities(&graph, algorithm))
    }
}

// ==========================================
// ROW TYPES
// ==========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRow {
    key: String,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    metadata: DocMetadata,
}

impl DocumentRow {
    fn into_document(self) -> Document {
        Document {
            id: self.key,
            embedding: self.embedding,
            metadata: self.metadata,
            score: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScoredDocument {
    key: String,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    metadata: DocMetadata,
    score: f32,
}

impl ScoredDocument {
    fn into_document(self) -> Document {
        Document {
            id: self.key,
            embedding: self.embedding,
            metadata: self.metadata,
            score: Some(self.score),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntityHit {
    key: String,
    name: String,
    entity_type: EntityType,
    #[serde(default)]
    description: String,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
}

impl EntityHit {
    fn into_entity(self) -> Entity {
        Entity {
            name: self.name,
            entity_type: self.entity_type,
            description: self.description,
            embedding: self.embedding,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntityName {
    key: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct EntityNode {
    key: String,
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RelationEdge {
    source_key: String,
    target_key: String,
    #[serde(default = "default_strength")]
    strength: f64,
}

fn default_strength() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct MentionRow {
    document: String,
    entity: String,
    count: u64,
}
