//! Entity types - people, organizations, products, etc.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The type/classification of an entity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    /// A person
    Person,
    /// An organization or company
    Org,
    /// A place
    Location,
    /// A product, tool or artifact
    Product,
    /// Something that happened
    Event,
    /// An abstract idea
    Concept,
}

impl EntityType {
    /// Every entity type, in prompt order
    pub const ALL: [EntityType; 6] = [
        EntityType::Person,
        EntityType::Org,
        EntityType::Location,
        EntityType::Product,
        EntityType::Event,
        EntityType::Concept,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Org => "ORG",
            EntityType::Location => "LOCATION",
            EntityType::Product => "PRODUCT",
            EntityType::Event => "EVENT",
            EntityType::Concept => "CONCEPT",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CoreError::Validation(format!("unknown entity type '{}'", s)))
    }
}

/// An entity extracted from documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Display name, never empty
    pub name: String,

    /// The type of entity
    #[serde(rename = "type")]
    pub entity_type: EntityType,

    /// Short description
    #[serde(default)]
    pub description: String,

    /// Vector embedding of the entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Entity {
    /// Create a new entity, rejecting blank names
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        description: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(CoreError::Validation("entity name must not be empty".into()));
        }
        Ok(Self {
            name,
            entity_type,
            description: description.into().trim().to_string(),
            embedding: None,
        })
    }

    /// Canonicalize a name for deduplication
    pub fn canonicalize(name: &str) -> String {
        name.to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Identity key: the canonical (case-insensitive) name
    pub fn key(&self) -> String {
        Self::canonicalize(&self.name)
    }

    /// Text used to embed the entity: `name (TYPE): description`
    pub fn embedding_text(&self) -> String {
        format!("{} ({}): {}", self.name, self.entity_type, self.description)
    }

    /// Builder: set embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}
