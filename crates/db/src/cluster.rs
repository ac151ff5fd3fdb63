//! Community detection over the entity graph
//!
//! Louvain modularity optimisation: repeated local moving followed by
//! aggregation, each aggregation pass that still merges something yields
//! one more hierarchy level. The Leiden variant additionally refines every
//! community into its connected components before aggregating, so no
//! reported community is internally disconnected.

use graphkb_core::{ClusterMember, CommunityAlgorithm, RawCommunity};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashMap};

/// Upper bound on hierarchy depth
const MAX_LEVELS: u32 = 4;

/// Upper bound on local-moving sweeps per level
const MAX_SWEEPS: usize = 64;

const MIN_GAIN: f64 = 1e-12;

/// Undirected weighted entity graph handed to the clustering pass
#[derive(Debug, Default)]
pub struct EntityGraph {
    graph: UnGraph<ClusterMember, f64>,
    index: HashMap<String, NodeIndex>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node keyed by its canonical name; repeated keys are ignored
    pub fn add_node(&mut self, key: impl Into<String>, member: ClusterMember) {
        let key = key.into();
        if self.index.contains_key(&key) {
            return;
        }
        let node = self.graph.add_node(member);
        self.index.insert(key, node);
    }

    /// Add an undirected edge; unknown endpoints are skipped
    pub fn add_edge(&mut self, a: &str, b: &str, weight: f64) -> bool {
        match (self.index.get(a), self.index.get(b)) {
            (Some(&u), Some(&v)) if weight > 0.0 => {
                self.graph.add_edge(u, v, weight);
                true
            }
            _ => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    fn edges(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.graph
            .edge_references()
            .map(|e| (e.source().index(), e.target().index(), *e.weight()))
    }
}

/// Working graph for one level of the hierarchy.
///
/// Parallel edges are merged; self-loops carry the weight internal to an
/// aggregated node and are kept beside the graph.
struct LevelGraph {
    graph: UnGraph<(), f64>,
    self_loops: Vec<f64>,
    degree: Vec<f64>,
    total_weight: f64,
}

impl LevelGraph {
    fn from_edges(node_count: usize, edges: impl IntoIterator<Item = (usize, usize, f64)>) -> Self {
        let mut merged: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for (u, v, w) in edges {
            *merged.entry((u.min(v), u.max(v))).or_insert(0.0) += w;
        }

        let mut graph: UnGraph<(), f64> = UnGraph::with_capacity(node_count, merged.len());
        for _ in 0..node_count {
            graph.add_node(());
        }
        let mut self_loops = vec![0.0; node_count];
        let mut degree = vec![0.0; node_count];
        let mut total_weight = 0.0;
        for ((u, v), w) in merged {
            total_weight += w;
            if u == v {
                self_loops[u] += w;
                degree[u] += 2.0 * w;
            } else {
                graph.add_edge(NodeIndex::new(u), NodeIndex::new(v), w);
                degree[u] += w;
                degree[v] += w;
            }
        }

        Self {
            graph,
            self_loops,
            degree,
            total_weight,
        }
    }

    fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Neighbors of `node` with the weight of the connecting edge
    fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let node = NodeIndex::new(node);
        self.graph.edges(node).map(move |e| {
            let other = if e.source() == node { e.target() } else { e.source() };
            (other.index(), *e.weight())
        })
    }

    /// Move nodes between communities while modularity improves
    fn local_moving(&self) -> Vec<usize> {
        let n = self.node_count();
        let mut community: Vec<usize> = (0..n).collect();
        if self.total_weight <= 0.0 {
            return community;
        }

        let two_m = 2.0 * self.total_weight;
        let mut community_degree = self.degree.clone();

        for _ in 0..MAX_SWEEPS {
            let mut moved = false;

            for node in 0..n {
                let current = community[node];
                let k = self.degree[node];

                let mut links: BTreeMap<usize, f64> = BTreeMap::new();
                for (neighbor, w) in self.neighbors(node) {
                    *links.entry(community[neighbor]).or_insert(0.0) += w;
                }

                community_degree[current] -= k;
                let gain = |c: usize, w_in: f64| w_in - community_degree[c] * k / two_m;

                let mut best = current;
                let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
                for (&candidate, &w_in) in &links {
                    let g = gain(candidate, w_in);
                    if g > best_gain + MIN_GAIN {
                        best = candidate;
                        best_gain = g;
                    }
                }

                community_degree[best] += k;
                if best != current {
                    community[node] = best;
                    moved = true;
                }
            }

            if !moved {
                break;
            }
        }

        community
    }

    /// Split every community into its connected components
    fn refine(&self, community: &[usize]) -> Vec<usize> {
        let mut components = UnionFind::new(self.node_count());
        for edge in self.graph.edge_references() {
            let (u, v) = (edge.source().index(), edge.target().index());
            if community[u] == community[v] {
                components.union(u, v);
            }
        }
        components.into_labeling()
    }

    /// Collapse each community into a single node
    fn aggregate(&self, community: &[usize], community_count: usize) -> LevelGraph {
        let between = self.graph.edge_references().map(|e| {
            (
                community[e.source().index()],
                community[e.target().index()],
                *e.weight(),
            )
        });
        let within = self
            .self_loops
            .iter()
            .enumerate()
            .filter(|(_, &w)| w > 0.0)
            .map(|(node, &w)| (community[node], community[node], w));
        LevelGraph::from_edges(community_count, between.chain(within))
    }
}

/// Renumber community labels densely, ordered by first appearance
fn compact(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let compacted = labels
        .iter()
        .map(|label| {
            let next = mapping.len();
            *mapping.entry(*label).or_insert(next)
        })
        .collect();
    (compacted, mapping.len())
}

/// Run community detection and return every level of the hierarchy
pub fn detect_communities(graph: &EntityGraph, algorithm: CommunityAlgorithm) -> Vec<RawCommunity> {
    let node_count = graph.node_count();
    if node_count == 0 {
        return Vec::new();
    }

    let mut level_graph = LevelGraph::from_edges(node_count, graph.edges());
    // membership of each original entity in the current level's nodes
    let mut assignment: Vec<usize> = (0..node_count).collect();
    let mut previous_count = node_count;
    let mut result = Vec::new();

    for level in 0..MAX_LEVELS {
        let mut partition = level_graph.local_moving();
        if algorithm == CommunityAlgorithm::Leiden {
            partition = level_graph.refine(&partition);
        }
        let (partition, community_count) = compact(&partition);

        if level > 0 && community_count >= previous_count {
            break;
        }

        assignment = assignment.iter().map(|&node| partition[node]).collect();
        result.extend(collect_level(graph, &assignment, community_count, level));

        if community_count == 1 || community_count == level_graph.node_count() {
            break;
        }
        level_graph = level_graph.aggregate(&partition, community_count);
        previous_count = community_count;
    }

    result
}

fn collect_level(
    graph: &EntityGraph,
    assignment: &[usize],
    community_count: usize,
    level: u32,
) -> Vec<RawCommunity> {
    let mut communities: Vec<RawCommunity> = (0..community_count)
        .map(|cluster_id| RawCommunity {
            cluster_id: cluster_id as u64,
            level,
            members: Vec::new(),
        })
        .collect();

    for (node, &community) in assignment.iter().enumerate() {
        communities[community]
            .members
            .push(graph.graph[NodeIndex::new(node)].clone());
    }

    communities.retain(|c| !c.members.is_empty());
    communities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str) -> ClusterMember {
        ClusterMember {
            name: name.to_string(),
            description: format!("{} description", name),
        }
    }

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> EntityGraph {
        let mut g = EntityGraph::new();
        for n in nodes {
            g.add_node(n.to_string(), member(n));
        }
        for (a, b) in edges {
            assert!(g.add_edge(a, b, 1.0));
        }
        g
    }

    fn names_at_level(communities: &[RawCommunity], level: u32) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = communities
            .iter()
            .filter(|c| c.level == level)
            .map(|c| {
                let mut names = c.member_names();
                names.sort();
                names
            })
            .collect();
        groups.sort();
        groups
    }

    #[test]
    fn test_two_cliques_split() {
        let g = graph(
            &["a", "b", "c", "x", "y", "z"],
            &[
                ("a", "b"),
                ("b", "c"),
                ("a", "c"),
                ("x", "y"),
                ("y", "z"),
                ("x", "z"),
                ("c", "x"),
            ],
        );

        for algorithm in [CommunityAlgorithm::Louvain, CommunityAlgorithm::Leiden] {
            let communities = detect_communities(&g, algorithm);
            assert_eq!(
                names_at_level(&communities, 0),
                vec![vec!["a", "b", "c"], vec!["x", "y", "z"]]
            );
        }
    }

    #[test]
    fn test_isolated_nodes_are_singletons() {
        let g = graph(&["solo", "a", "b"], &[("a", "b")]);
        let communities = detect_communities(&g, CommunityAlgorithm::Leiden);

        assert_eq!(names_at_level(&communities, 0), vec![vec!["a", "b"], vec!["solo"]]);
    }

    #[test]
    fn test_empty_graph() {
        assert!(detect_communities(&EntityGraph::new(), CommunityAlgorithm::Louvain).is_empty());
    }

    #[test]
    fn test_unknown_edge_endpoints_are_ignored() {
        let mut g = graph(&["a"], &[]);
        assert!(!g.add_edge("a", "missing", 1.0));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_every_node_assigned_once_per_level() {
        let g = graph(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("b", "c"), ("c", "d"), ("d", "e"), ("e", "a")],
        );
        let communities = detect_communities(&g, CommunityAlgorithm::Leiden);
        let levels = communities.iter().map(|c| c.level).max().unwrap_or(0);

        for level in 0..=levels {
            let total: usize = communities
                .iter()
                .filter(|c| c.level == level)
                .map(|c| c.members.len())
                .sum();
            assert_eq!(total, 5);
        }
    }

    #[test]
    fn test_leiden_refinement_splits_disconnected_community() {
        let g = graph(&["a", "b", "c", "d"], &[("a", "b"), ("c", "d")]);
        let refined = LevelGraph::from_edges(4, g.edges()).refine(&[0, 0, 0, 0]);

        assert_eq!(refined[0], refined[1]);
        assert_eq!(refined[2], refined[3]);
        assert_ne!(refined[0], refined[2]);
    }
}
