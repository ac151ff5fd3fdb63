//! Search modes and community detection algorithms

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Retrieval strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Pure vector similarity
    Vector,
    /// Traversal of the entity graph from the nearest entities
    Graph,
    /// Weighted fusion of vector and graph results
    #[default]
    Hybrid,
    /// Ranking by relevance to matched entity communities
    Global,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Vector => write!(f, "vector"),
            SearchMode::Graph => write!(f, "graph"),
            SearchMode::Hybrid => write!(f, "hybrid"),
            SearchMode::Global => write!(f, "global"),
        }
    }
}

impl FromStr for SearchMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(SearchMode::Vector),
            "graph" => Ok(SearchMode::Graph),
            "hybrid" => Ok(SearchMode::Hybrid),
            "global" => Ok(SearchMode::Global),
            _ => Err(CoreError::UnknownSearchMode(s.to_string())),
        }
    }
}

/// Community detection algorithm run by the graph engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommunityAlgorithm {
    /// Louvain with a connectivity refinement step
    #[default]
    Leiden,
    Louvain,
}

impl fmt::Display for CommunityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunityAlgorithm::Leiden => write!(f, "leiden"),
            CommunityAlgorithm::Louvain => write!(f, "louvain"),
        }
    }
}

impl FromStr for CommunityAlgorithm {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leiden" => Ok(CommunityAlgorithm::Leiden),
            "louvain" => Ok(CommunityAlgorithm::Louvain),
            _ => Err(CoreError::UnknownAlgorithm(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_mode_round_trip() {
        for mode in [
            SearchMode::Vector,
            SearchMode::Graph,
            SearchMode::Hybrid,
            SearchMode::Global,
        ] {
            assert_eq!(mode.to_string().parse::<SearchMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let err = "semantic".parse::<SearchMode>().unwrap_err();
        assert!(matches!(err, CoreError::UnknownSearchMode(ref m) if m == "semantic"));
    }

    #[test]
    fn test_defaults() {
        assert_eq!(SearchMode::default(), SearchMode::Hybrid);
        assert_eq!(CommunityAlgorithm::default(), CommunityAlgorithm::Leiden);
        assert_eq!("LOUVAIN".parse::<CommunityAlgorithm>().unwrap(), CommunityAlgorithm::Louvain);
        assert!("girvan-newman".parse::<CommunityAlgorithm>().is_err());
    }
}
