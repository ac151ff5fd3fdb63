//! Relationship types - typed links between entities

use crate::entity::Entity;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// A relationship in the knowledge graph.
///
/// Endpoints are entity names; the store resolves them to entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Source entity name
    pub source: String,

    /// Target entity name
    pub target: String,

    /// Relationship type, e.g. WORKS_FOR
    #[serde(rename = "type")]
    pub relation_type: String,

    #[serde(default)]
    pub description: String,

    /// Strength in [0, 1]
    #[serde(default = "default_strength")]
    pub strength: f32,
}

fn default_strength() -> f32 {
    1.0
}

impl Relationship {
    /// Create a new relationship with full strength
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation_type: impl AsRef<str>,
        description: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into().trim().to_string();
        let target = target.into().trim().to_string();
        let relation_type = Self::normalize_type(relation_type.as_ref());

        if source.is_empty() || target.is_empty() {
            return Err(CoreError::Validation(
                "relationship endpoints must not be empty".into(),
            ));
        }
        if relation_type.is_empty() {
            return Err(CoreError::Validation(
                "relationship type must not be empty".into(),
            ));
        }

        Ok(Self {
            source,
            target,
            relation_type,
            description: description.into().trim().to_string(),
            strength: default_strength(),
        })
    }

    /// Builder: set strength, rejecting values outside [0, 1]
    pub fn with_strength(mut self, strength: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(CoreError::Validation(format!(
                "relationship strength {} outside [0, 1]",
                strength
            )));
        }
        self.strength = strength;
        Ok(self)
    }

    /// Uppercase, spaces to underscores: "works for" -> "WORKS_FOR"
    pub fn normalize_type(raw: &str) -> String {
        raw.trim().to_uppercase().replace(' ', "_")
    }

    /// Deduplication key: (lower(source), lower(target), type)
    pub fn key(&self) -> (String, String, String) {
        (
            Entity::canonicalize(&self.source),
            Entity::canonicalize(&self.target),
            self.relation_type.clone(),
        )
    }
}
