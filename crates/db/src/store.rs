//! Storage abstraction for the knowledge base.
//!
//! Backends come in two capabilities. Every backend implements [`Store`]
//! (documents and similarity search). Graph-capable backends additionally
//! implement [`GraphStore`]: entities, relationships, communities,
//! traversal and clustering.
//!
//! | Method | Capability |
//! |--------|------------|
//! | [`add_documents`](Store::add_documents) | store |
//! | [`search_documents`](Store::search_documents) | store |
//! | [`add_entities`](GraphStore::add_entities) | graph |
//! | [`add_relationships`](GraphStore::add_relationships) | graph |
//! | [`add_communities`](GraphStore::add_communities) | graph |
//! | [`replace_communities`](GraphStore::replace_communities) | graph |
//! | [`search_entities`](GraphStore::search_entities) | graph |
//! | [`search_communities`](GraphStore::search_communities) | graph |
//! | [`traverse_from_entities`](GraphStore::traverse_from_entities) | graph |
//! | [`query_documents_by_entities`](GraphStore::query_documents_by_entities) | graph |
//! | [`run_clustering`](GraphStore::run_clustering) | graph |

use crate::Result;
use async_trait::async_trait;
use graphkb_core::{
    Community, CommunityAlgorithm, Document, Entity, RawCommunity, Relationship,
};
use std::cmp::Ordering;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::{Bfs, VisitMap};
use std::collections::HashMap;

/// Minimal capability shared by all backends
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert documents, overwriting any with the same id
    async fn add_documents(&self, documents: &[Document]) -> Result<()>;

    /// Nearest documents by cosine similarity, with `score` set.
    ///
    /// Results below `threshold` are dropped.
    async fn search_documents(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<Document>>;
}

/// Graph capability: entities, relationships and communities
#[async_trait]
pub trait GraphStore: Store {
    /// Upsert entities by case-insensitive name and record one more
    /// mention of each in `document_id`
    async fn add_entities(&self, entities: &[Entity], document_id: &str) -> Result<()>;

    /// Upsert relationships by `(source, target, type)`
    async fn add_relationships(&self, relationships: &[Relationship]) -> Result<()>;

    /// Replace every stored community at the levels present in `communities`
    async fn add_communities(&self, communities: &[Community]) -> Result<()>;

    /// Drop every stored community and write `communities` in their place
    async fn replace_communities(&self, communities: &[Community]) -> Result<()>;

    /// Nearest entities to the query embedding
    async fn search_entities(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<Entity>>;

    /// Nearest communities with `level >= min_level`, with `score` set
    async fn search_communities(
        &self,
        query_embedding: &[f32],
        min_level: u32,
        limit: usize,
    ) -> Result<Vec<Community>>;

    /// Documents reachable from the `seed_limit` entities nearest the seed
    /// embedding, walking relationships in either direction up to
    /// `max_hops`. Each document is scored `1 / (hops + 1)` by its closest
    /// mentioned entity; seeds sit at hop 0.
    async fn traverse_from_entities(
        &self,
        seed_embedding: &[f32],
        seed_limit: usize,
        max_hops: u32,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Documents mentioning any of `entity_names`, with mention statistics
    async fn query_documents_by_entities(
        &self,
        entity_names: &[String],
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<EntityDocumentMatch>>;

    /// Cluster the persisted entity graph
    async fn run_clustering(&self, algorithm: CommunityAlgorithm) -> Result<Vec<RawCommunity>>;
}

/// A document matched by entity mentions
#[derive(Debug, Clone)]
pub struct EntityDocumentMatch {
    pub document: Document,

    /// Number of distinct queried entities the document mentions
    pub entity_count: usize,

    /// Sum of mention counts over those entities
    pub total_mentions: u64,

    /// Display names of the mentioned entities
    pub mentioned_entities: Vec<String>,

    /// Cosine similarity between the document and the query
    pub vector_similarity: f32,
}

impl EntityDocumentMatch {
    /// Order by similarity, then entity count, then mentions, all descending
    pub fn rank(a: &Self, b: &Self) -> Ordering {
        b.vector_similarity
            .partial_cmp(&a.vector_similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.entity_count.cmp(&a.entity_count))
            .then_with(|| b.total_mentions.cmp(&a.total_mentions))
    }
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Sort by descending score, ties keep insertion order
pub(crate) fn sort_by_score_desc<T>(items: &mut [(f32, T)]) {
    items.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
}

/// Breadth-first hop distances from the seeds over undirected edges.
///
/// Seeds are at hop 0; nodes further than `max_hops` are not reported.
pub(crate) fn hop_distances(
    seeds: &[String],
    edges: &[(String, String)],
    max_hops: u32,
) -> HashMap<String, u32> {
    let mut graph: UnGraph<&str, ()> = UnGraph::default();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    let seed_nodes: Vec<NodeIndex> = seeds
        .iter()
        .map(|seed| node_for(&mut graph, &mut index, seed))
        .collect();
    for (a, b) in edges {
        let u = node_for(&mut graph, &mut index, a);
        let v = node_for(&mut graph, &mut index, b);
        graph.add_edge(u, v, ());
    }

    let Some(&first) = seed_nodes.first() else {
        return HashMap::new();
    };
    let mut depth: HashMap<NodeIndex, u32> = HashMap::new();
    let mut bfs = Bfs::new(&graph, first);
    for &seed in &seed_nodes {
        depth.insert(seed, 0);
        if bfs.discovered.visit(seed) {
            bfs.stack.push_back(seed);
        }
    }

    // nodes come off the queue in hop order, so the first parent to reach a
    // node is on a shortest path
    while let Some(node) = bfs.next(&graph) {
        let Some(&hop) = depth.get(&node) else {
            continue;
        };
        if hop >= max_hops {
            continue;
        }
        for next in graph.neighbors(node) {
            depth.entry(next).or_insert(hop + 1);
        }
    }

    depth
        .into_iter()
        .map(|(node, hop)| (graph[node].to_string(), hop))
        .collect()
}

fn node_for<'a>(
    graph: &mut UnGraph<&'a str, ()>,
    index: &mut HashMap<&'a str, NodeIndex>,
    name: &'a str,
) -> NodeIndex {
    *index.entry(name).or_insert_with(|| graph.add_node(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_match_ranking() {
        let doc = Document::new("d", "text");
        let m = |sim: f32, count: usize, mentions: u64| EntityDocumentMatch {
            document: doc.clone(),
            entity_count: count,
            total_mentions: mentions,
            mentioned_entities: Vec::new(),
            vector_similarity: sim,
        };

        let mut matches = vec![m(0.5, 1, 1), m(0.9, 1, 1), m(0.5, 3, 1), m(0.5, 3, 7)];
        matches.sort_by(EntityDocumentMatch::rank);

        let order: Vec<(f32, usize, u64)> = matches
            .iter()
            .map(|m| (m.vector_similarity, m.entity_count, m.total_mentions))
            .collect();
        assert_eq!(order, vec![(0.9, 1, 1), (0.5, 3, 7), (0.5, 3, 1), (0.5, 1, 1)]);
    }

    #[test]
    fn test_hop_distances() {
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("c".to_string(), "b".to_string()),
            ("c".to_string(), "d".to_string()),
        ];
        let hops = hop_distances(&["a".to_string()], &edges, 2);

        assert_eq!(hops.get("a"), Some(&0));
        assert_eq!(hops.get("b"), Some(&1));
        assert_eq!(hops.get("c"), Some(&2));
        assert_eq!(hops.get("d"), None);
    }

    #[test]
    fn test_hop_distances_multiple_seeds() {
        let edges = vec![
            ("a".to_string(), "b".to_string()),
            ("b".to_string(), "c".to_string()),
            ("c".to_string(), "d".to_string()),
            ("d".to_string(), "e".to_string()),
        ];
        let seeds = vec!["a".to_string(), "e".to_string(), "lonely".to_string()];
        let hops = hop_distances(&seeds, &edges, 1);

        assert_eq!(hops.get("a"), Some(&0));
        assert_eq!(hops.get("e"), Some(&0));
        assert_eq!(hops.get("lonely"), Some(&0));
        assert_eq!(hops.get("b"), Some(&1));
        assert_eq!(hops.get("d"), Some(&1));
        assert_eq!(hops.get("c"), None);
    }

    #[test]
    fn test_hop_distances_zero_hops() {
        let edges = vec![("a".to_string(), "b".to_string())];
        let hops = hop_distances(&["a".to_string()], &edges, 0);
        assert_eq!(hops.len(), 1);
    }
}
