//! Community types - clusters of related entities and their summaries

use crate::mode::CommunityAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many member names the synthetic summary lists
const FALLBACK_NAME_COUNT: usize = 5;

/// Rating given to communities whose summary had to be synthesized
pub const FALLBACK_RATING: f32 = 0.5;

/// An entity as reported by the clustering pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A cluster straight out of the graph engine, before summarization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommunity {
    /// Cluster identifier as assigned by the clustering algorithm
    pub cluster_id: u64,

    /// Hierarchy depth, 0 is the finest level
    pub level: u32,

    pub members: Vec<ClusterMember>,
}

impl RawCommunity {
    /// Stable community id derived from level and cluster id
    pub fn community_id(&self) -> String {
        format!("comm_{}_{}", self.level, self.cluster_id)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}

/// A detected community of related entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,

    /// Hierarchy depth, 0 is the finest level
    pub level: u32,

    pub title: String,

    /// Never empty; the embedding is computed from it
    pub summary: String,

    /// Importance in [0, 1]
    pub rating: f32,

    pub entity_count: usize,

    /// Names of the member entities
    #[serde(default)]
    pub entity_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Similarity to the query, only set on search results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Community {
    /// Build a community from a generated title and summary.
    ///
    /// Falls back to the synthetic summary when the generated one is blank.
    pub fn summarized(raw: &RawCommunity, title: &str, summary: &str) -> Self {
        let summary = summary.trim();
        if summary.is_empty() {
            return Self::fallback(raw);
        }

        let title = match title.trim() {
            "" => format!("Community {}", raw.community_id()),
            t => t.to_string(),
        };
        let entity_count = raw.members.len();

        Self {
            id: raw.community_id(),
            level: raw.level,
            title,
            summary: summary.to_string(),
            rating: (entity_count as f32 / 10.0).min(1.0),
            entity_count,
            entity_ids: raw.member_names(),
            embedding: None,
            score: None,
        }
    }

    /// Deterministic summary built from the member names
    pub fn fallback(raw: &RawCommunity) -> Self {
        let names = raw.member_names();
        let entity_count = names.len();
        let listed = names
            .iter()
            .take(FALLBACK_NAME_COUNT)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let summary = if listed.is_empty() {
            format!("An empty community ({})", raw.community_id())
        } else {
            format!("A community containing: {}", listed)
        };

        Self {
            id: raw.community_id(),
            level: raw.level,
            title: format!("Group of {} entities", entity_count),
            summary,
            rating: FALLBACK_RATING,
            entity_count,
            entity_ids: names,
            embedding: None,
            score: None,
        }
    }

    /// Builder: set embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Outcome label of a detection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Success,
    NoCommunitiesFound,
}

impl std::fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionStatus::Success => write!(f, "success"),
            DetectionStatus::NoCommunitiesFound => write!(f, "no_communities_found"),
        }
    }
}

/// Report returned by a community detection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub community_count: usize,
    /// `max(level) + 1` over the communities produced, 0 when none
    pub levels: u32,
    pub algorithm: CommunityAlgorithm,
    pub status: DetectionStatus,
    pub completed_at: DateTime<Utc>,
}

impl DetectionReport {
    pub fn from_communities(communities: &[Community], algorithm: CommunityAlgorithm) -> Self {
        let levels = communities.iter().map(|c| c.level + 1).max().unwrap_or(0);
        let status = if communities.is_empty() {
            DetectionStatus::NoCommunitiesFound
        } else {
            DetectionStatus::Success
        };
        Self {
            community_count: communities.len(),
            levels,
            algorithm,
            status,
            completed_at: Utc::now(),
        }
    }
}
