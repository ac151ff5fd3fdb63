//! Knowledge base configuration and per-call options

use crate::{EngineError, Result};
use graphkb_core::{CommunityAlgorithm, EntityType};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_CONCURRENCY: usize = 5;
const DEFAULT_MAX_ENTITIES_PER_CHUNK: usize = 10;
const DEFAULT_GLEANINGS_ROUNDS: usize = 2;
const DEFAULT_MAX_HOPS: u32 = 2;
const DEFAULT_COMMUNITY_LIMIT: usize = 5;
const DEFAULT_MAX_ENTITIES_PER_COMMUNITY: usize = 10;

pub(crate) fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn parse_flag(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    matches!(value.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn parse_positive<T: std::str::FromStr + PartialOrd + Default>(value: &str) -> Option<T> {
    value
        .trim()
        .parse::<T>()
        .ok()
        .filter(|value| *value > T::default())
}

/// Entity extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Upper bound on entities requested per document
    pub max_entities_per_chunk: usize,

    /// Run extra rounds asking for missed entities
    pub enable_gleanings: bool,
    pub gleanings_rounds: usize,

    /// Entity types the extractor accepts
    pub entity_types: Vec<EntityType>,

    /// Embed extracted entities (needed by graph and hybrid search)
    pub generate_entity_embeddings: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_entities_per_chunk: DEFAULT_MAX_ENTITIES_PER_CHUNK,
            enable_gleanings: false,
            gleanings_rounds: DEFAULT_GLEANINGS_ROUNDS,
            entity_types: EntityType::ALL.to_vec(),
            generate_entity_embeddings: true,
        }
    }
}

/// Configuration of a knowledge base instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBaseConfig {
    pub enable_entity_extraction: bool,
    pub enable_relationship_extraction: bool,
    pub enable_community_detection: bool,
    pub community_algorithm: CommunityAlgorithm,
    pub extraction: ExtractionConfig,

    /// Generation calls in flight at once during fan-out
    pub max_concurrency: usize,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            enable_entity_extraction: true,
            enable_relationship_extraction: true,
            enable_community_detection: false,
            community_algorithm: CommunityAlgorithm::default(),
            extraction: ExtractionConfig::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl KnowledgeBaseConfig {
    /// Defaults overridden by `GRAPHKB_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for `GRAPHKB_*` keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("GRAPHKB_ENABLE_ENTITY_EXTRACTION") {
            config.enable_entity_extraction = parse_flag(&v);
        }
        if let Some(v) = lookup("GRAPHKB_ENABLE_RELATIONSHIP_EXTRACTION") {
            config.enable_relationship_extraction = parse_flag(&v);
        }
        if let Some(v) = lookup("GRAPHKB_ENABLE_COMMUNITY_DETECTION") {
            config.enable_community_detection = parse_flag(&v);
        }
        if let Some(v) = lookup("GRAPHKB_COMMUNITY_ALGORITHM") {
            config.community_algorithm = v.parse()?;
        }
        if let Some(v) = lookup("GRAPHKB_MAX_CONCURRENCY").and_then(|v| parse_positive(&v)) {
            config.max_concurrency = v;
        }
        if let Some(v) = lookup("GRAPHKB_MAX_ENTITIES_PER_CHUNK").and_then(|v| parse_positive(&v)) {
            config.extraction.max_entities_per_chunk = v;
        }
        if let Some(v) = lookup("GRAPHKB_ENABLE_GLEANINGS") {
            config.extraction.enable_gleanings = parse_flag(&v);
        }
        if let Some(v) = lookup("GRAPHKB_GLEANINGS_ROUNDS").and_then(|v| parse_positive(&v)) {
            config.extraction.gleanings_rounds = v;
        }
        if let Some(v) = lookup("GRAPHKB_ENTITY_TYPES") {
            config.extraction.entity_types = v
                .split(',')
                .filter(|t| !t.trim().is_empty())
                .map(|t| {
                    t.parse::<EntityType>()
                        .map_err(|e| EngineError::Configuration(e.to_string()))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = lookup("GRAPHKB_GENERATE_ENTITY_EMBEDDINGS") {
            config.extraction.generate_entity_embeddings = parse_flag(&v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no pipeline can run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.enable_entity_extraction && self.extraction.entity_types.is_empty() {
            return Err(EngineError::Configuration(
                "entity extraction needs at least one entity type".into(),
            ));
        }
        if self.enable_entity_extraction && self.extraction.max_entities_per_chunk == 0 {
            return Err(EngineError::Configuration(
                "max_entities_per_chunk must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether ingestion will call the text generator
    pub fn needs_generator(&self) -> bool {
        self.enable_entity_extraction || self.enable_relationship_extraction
    }
}

/// Options for `add_documents`
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub cancel: Option<CancellationToken>,
}

impl AddOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Options for `detect_communities`
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    pub cancel: Option<CancellationToken>,
}

impl DetectOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Tuning knobs for `retrieve`
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Hybrid: weight of the vector score
    pub vector_weight: f32,
    /// Hybrid: weight of the graph score
    pub graph_weight: f32,
    /// Graph and hybrid: traversal depth
    pub max_hops: u32,
    /// Global: lowest community level considered
    pub min_community_level: u32,
    /// Global: member entities taken from each community
    pub max_entities_per_community: usize,
    /// Global: communities matched against the query
    pub community_limit: usize,
    pub cancel: Option<CancellationToken>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            graph_weight: 0.5,
            max_hops: DEFAULT_MAX_HOPS,
            min_community_level: 0,
            max_entities_per_community: DEFAULT_MAX_ENTITIES_PER_COMMUNITY,
            community_limit: DEFAULT_COMMUNITY_LIMIT,
            cancel: None,
        }
    }
}

impl SearchOptions {
    pub fn with_weights(mut self, vector_weight: f32, graph_weight: f32) -> Self {
        self.vector_weight = vector_weight;
        self.graph_weight = graph_weight;
        self
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_min_community_level(mut self, level: u32) -> Self {
        self.min_community_level = level;
        self
    }

    pub fn with_community_limit(mut self, limit: usize) -> Self {
        self.community_limit = limit;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let weights_ok = [self.vector_weight, self.graph_weight]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0);
        if !weights_ok {
            return Err(EngineError::Configuration(format!(
                "hybrid weights must be finite and non-negative (vector={}, graph={})",
                self.vector_weight, self.graph_weight
            )));
        }
        Ok(())
    }
}
