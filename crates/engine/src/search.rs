//! Search Engine - the four retrieval strategies over the store
//!
//! Every strategy is a function of the query embedding and the store state;
//! the engine itself holds no mutable state.

use crate::backend::StoreHandle;
use crate::concurrency::cancellable;
use crate::config::SearchOptions;
use crate::{EngineError, Result};
use graphkb_core::{Community, Document, Entity, SearchMode};
use graphkb_db::EntityDocumentMatch;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, instrument, warn};

/// Entities nearest the query that seed graph traversal
const SEED_ENTITIES: usize = 5;

const VECTOR_SHARE: f32 = 0.6;
const ENTITY_WEIGHT_SHARE: f32 = 0.2;
const ENTITY_RATIO_SHARE: f32 = 0.1;
const MENTION_SHARE: f32 = 0.1;

/// Mentions at which the mention factor saturates
const MENTION_SATURATION: f64 = 10.0;

/// Runs retrieval strategies against a store
pub struct SearchEngine {
    store: StoreHandle,
    community_detection: bool,
}

impl SearchEngine {
    pub fn new(store: StoreHandle, community_detection: bool) -> Self {
        Self {
            store,
            community_detection,
        }
    }

    /// Dispatch to the strategy named by `mode`
    #[instrument(skip(self, query_embedding, options))]
    pub async fn search(
        &self,
        mode: SearchMode,
        query_embedding: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        let cancel = options.cancel.as_ref();
        let results = match mode {
            SearchMode::Vector => {
                cancellable(cancel, self.vector(query_embedding, limit, score_threshold)).await?
            }
            SearchMode::Graph => {
                cancellable(cancel, self.graph(query_embedding, limit, options)).await?
            }
            SearchMode::Hybrid => {
                cancellable(
                    cancel,
                    self.hybrid(query_embedding, limit, score_threshold, options),
                )
                .await?
            }
            SearchMode::Global => {
                cancellable(cancel, self.global(query_embedding, limit, options)).await?
            }
        };

        info!(mode = %mode, found = results.len(), "Search finished");
        Ok(results)
    }

    /// Nearest documents by embedding similarity
    pub async fn vector(
        &self,
        query_embedding: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<Document>> {
        debug!("Executing vector search");
        Ok(self
            .store
            .search_documents(query_embedding, limit, score_threshold)
            .await?)
    }

    /// Documents reached by traversing from the entities nearest the query
    pub async fn graph(
        &self,
        query_embedding: &[f32],
        limit: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        debug!(max_hops = options.max_hops, "Executing graph search");
        let store = self.store.graph().ok_or_else(|| {
            EngineError::Configuration("graph search needs a graph-capable store".into())
        })?;

        store
            .traverse_from_entities(query_embedding, SEED_ENTITIES, options.max_hops, limit)
            .await
            .map_err(|e| EngineError::GraphQuery(format!("Graph traversal failed: {}", e)))
    }

    /// Weighted fusion of vector and graph results.
    ///
    /// Both branches always run to completion; a failing branch counts as
    /// empty.
    pub async fn hybrid(
        &self,
        query_embedding: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        debug!("Executing hybrid search");
        options.validate()?;

        let graph_branch = async {
            if self.store.is_graph_capable() {
                self.graph(query_embedding, limit, options).await
            } else {
                debug!("Store has no graph capability, graph branch is empty");
                Ok(Vec::new())
            }
        };
        let (vector_results, graph_results) = tokio::join!(
            self.vector(query_embedding, limit, score_threshold),
            graph_branch
        );

        let vector_results = vector_results.unwrap_or_else(|e| {
            error!("Vector search failed: {}", e);
            Vec::new()
        });
        let graph_results = graph_results.unwrap_or_else(|e| {
            error!("Graph search failed: {}", e);
            Vec::new()
        });

        debug!(
            vector = vector_results.len(),
            graph = graph_results.len(),
            "Fusing hybrid results"
        );
        Ok(fuse_hybrid(
            vector_results,
            graph_results,
            options.vector_weight,
            options.graph_weight,
            limit,
        ))
    }

    /// Rank documents by their relevance to the communities nearest the query
    pub async fn global(
        &self,
        query_embedding: &[f32],
        limit: usize,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        if !self.community_detection {
            return Err(EngineError::Configuration(
                "global search requires community detection to be enabled".into(),
            ));
        }
        let store = self.store.graph().ok_or_else(|| {
            EngineError::Configuration("global search needs a graph-capable store".into())
        })?;
        debug!("Executing global search");

        let communities = store
            .search_communities(
                query_embedding,
                options.min_community_level,
                options.community_limit,
            )
            .await
            .map_err(|e| EngineError::GraphQuery(format!("Global search failed: {}", e)))?;
        if communities.is_empty() {
            warn!("No communities found, falling back to vector search");
            return self.vector(query_embedding, limit, None).await;
        }

        let weights = entity_weights(&communities, options.max_entities_per_community);
        if weights.is_empty() {
            warn!("No entities found in communities, falling back to vector search");
            return self.vector(query_embedding, limit, None).await;
        }

        let names: Vec<String> = weights.values().map(|(name, _)| name.clone()).collect();
        let candidates = store
            .query_documents_by_entities(&names, query_embedding, limit.saturating_mul(2))
            .await
            .map_err(|e| EngineError::GraphQuery(format!("Global search failed: {}", e)))?;
        if candidates.is_empty() {
            warn!("No documents mention the community entities, falling back to vector search");
            return self.vector(query_embedding, limit, None).await;
        }

        let mut documents: Vec<Document> = candidates
            .into_iter()
            .map(|candidate| {
                let score = score_global_candidate(&candidate, &weights);
                candidate.document.with_score(score)
            })
            .collect();
        sort_documents(&mut documents);
        documents.truncate(limit);

        debug!(
            found = documents.len(),
            entities = weights.len(),
            communities = communities.len(),
            "Global search ranked documents"
        );
        Ok(documents)
    }
}

fn score_of(doc: &Document) -> f32 {
    doc.score.unwrap_or(0.0)
}

fn sort_documents(documents: &mut [Document]) {
    documents.sort_by(|a, b| {
        score_of(b)
            .partial_cmp(&score_of(a))
            .unwrap_or(Ordering::Equal)
    });
}

/// Combine vector and graph results: `vector_weight * v + graph_weight * g`,
/// a missing score counting as 0
pub fn fuse_hybrid(
    vector_results: Vec<Document>,
    graph_results: Vec<Document>,
    vector_weight: f32,
    graph_weight: f32,
    limit: usize,
) -> Vec<Document> {
    let mut order: Vec<String> = Vec::new();
    let mut combined: HashMap<String, (Document, f32)> = HashMap::new();

    let weighted = vector_results
        .into_iter()
        .map(|d| (d, vector_weight))
        .chain(graph_results.into_iter().map(|d| (d, graph_weight)));
    for (doc, weight) in weighted {
        let contribution = score_of(&doc) * weight;
        match combined.get_mut(&doc.id) {
            Some((_, total)) => *total += contribution,
            None => {
                order.push(doc.id.clone());
                combined.insert(doc.id.clone(), (doc, contribution));
            }
        }
    }

    let mut fused: Vec<Document> = order
        .into_iter()
        .filter_map(|id| combined.remove(&id))
        .map(|(doc, score)| doc.with_score(score))
        .collect();
    sort_documents(&mut fused);
    fused.truncate(limit);
    fused
}

/// Weight of each community member entity: the similarity of its best
/// community. At most `max_per_community` members are taken per community.
///
/// Keyed by canonical name; values hold the display name and the weight.
pub fn entity_weights(
    communities: &[Community],
    max_per_community: usize,
) -> BTreeMap<String, (String, f32)> {
    let mut weights: BTreeMap<String, (String, f32)> = BTreeMap::new();
    for community in communities {
        let weight = community.score.unwrap_or(1.0);
        for name in community.entity_ids.iter().take(max_per_community) {
            let entry = weights
                .entry(Entity::canonicalize(name))
                .or_insert_with(|| (name.clone(), weight));
            entry.1 = entry.1.max(weight);
        }
    }
    weights
}

/// Global-search score of one candidate:
/// `0.6 v + 0.2 (sum of weights / (n * max weight)) + 0.1 (count / n) + 0.1 min(ln(1+m)/ln(11), 1)`
pub fn score_global_candidate(
    candidate: &EntityDocumentMatch,
    weights: &BTreeMap<String, (String, f32)>,
) -> f32 {
    let entity_total = weights.len() as f32;
    let max_weight = weights
        .values()
        .map(|(_, w)| *w)
        .fold(0.0f32, f32::max);
    let max_possible = entity_total * max_weight;
    if max_possible <= 0.0 {
        return 0.0;
    }

    let weight_sum: f32 = candidate
        .mentioned_entities
        .iter()
        .filter_map(|name| weights.get(&Entity::canonicalize(name)))
        .map(|(_, w)| *w)
        .sum();
    let base_score = weight_sum / max_possible;
    let entity_ratio = candidate.entity_count as f32 / entity_total;
    let mention_factor =
        ((candidate.total_mentions as f64).ln_1p() / MENTION_SATURATION.ln_1p()).min(1.0) as f32;

    VECTOR_SHARE * candidate.vector_similarity
        + ENTITY_WEIGHT_SHARE * base_score
        + ENTITY_RATIO_SHARE * entity_ratio
        + MENTION_SHARE * mention_factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphkb_core::{ClusterMember, RawCommunity};

    fn scored(id: &str, score: f32) -> Document {
        Document::new(id, id).with_score(score)
    }

    fn community(names: &[&str], score: f32) -> Community {
        let mut c = Community::fallback(&RawCommunity {
            cluster_id: 0,
            level: 0,
            members: names
                .iter()
                .map(|n| ClusterMember {
                    name: n.to_string(),
                    description: String::new(),
                })
                .collect(),
        });
        c.score = Some(score);
        c
    }

    #[test]
    fn test_vector_only_document_gets_weighted_score() {
        let fused = fuse_hybrid(vec![scored("a", 0.8)], Vec::new(), 0.5, 0.5, 5);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score.unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_fusion_sums_both_branches() {
        let fused = fuse_hybrid(
            vec![scored("a", 0.8), scored("b", 0.9)],
            vec![scored("a", 1.0), scored("c", 0.5)],
            0.5,
            0.5,
            10,
        );
        let ids: Vec<&str> = fused.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!((fused[0].score.unwrap() - 0.9).abs() < 1e-6);
        assert!((fused[2].score.unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_fusion_respects_limit() {
        let fused = fuse_hybrid(
            vec![scored("a", 0.1), scored("b", 0.2), scored("c", 0.3)],
            Vec::new(),
            1.0,
            0.0,
            2,
        );
        let ids: Vec<&str> = fused.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn test_entity_weights_keep_max() {
        let weights = entity_weights(
            &[
                community(&["Alice", "OpenAI"], 0.4),
                community(&["alice", "Bob"], 0.9),
            ],
            10,
        );
        assert_eq!(weights.len(), 3);
        assert_eq!(weights["alice"], ("Alice".to_string(), 0.9));
        assert_eq!(weights["openai"].1, 0.4);
    }

    #[test]
    fn test_entity_weights_cap_per_community() {
        let weights = entity_weights(&[community(&["a", "b", "c"], 0.5)], 2);
        assert_eq!(weights.len(), 2);
        assert!(!weights.contains_key("c"));
    }

    #[test]
    fn test_global_score_formula() {
        let weights = entity_weights(&[community(&["Alice", "Bob"], 0.5)], 10);
        let candidate = EntityDocumentMatch {
            document: Document::new("d", "text"),
            entity_count: 1,
            total_mentions: 10,
            mentioned_entities: vec!["Alice".into()],
            vector_similarity: 0.5,
        };

        // 0.6*0.5 + 0.2*(0.5/(2*0.5)) + 0.1*(1/2) + 0.1*1
        let score = score_global_candidate(&candidate, &weights);
        assert!((score - 0.55).abs() < 1e-5);
    }

    #[test]
    fn test_global_score_zero_weights() {
        let weights = entity_weights(&[community(&["Alice"], 0.0)], 10);
        let candidate = EntityDocumentMatch {
            document: Document::new("d", "text"),
            entity_count: 1,
            total_mentions: 1,
            mentioned_entities: vec!["Alice".into()],
            vector_similarity: 0.9,
        };
        assert_eq!(score_global_candidate(&candidate, &weights), 0.0);
    }
}
