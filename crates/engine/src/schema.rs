//! Closed record schemas for model output.
//!
//! Each extraction kind has one record type. Records reject unknown fields,
//! and conversion into domain types re-validates every invariant, so model
//! output never reaches the store unchecked.

use crate::json::{parse_json_array, parse_json_object};
use crate::Result;
use graphkb_core::{CoreError, Entity, EntityType, Relationship};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Bumped whenever a record shape changes
pub const SCHEMA_VERSION: u32 = 1;

const MAX_NAME_LEN: usize = 120;
const MAX_TYPE_LEN: usize = 60;

/// A record kind the models are asked to produce
pub trait ExtractionSchema: DeserializeOwned {
    /// Name used in logs
    const KIND: &'static str;

    /// JSON schema of a single record
    fn json_schema() -> Value;
}

/// `{name, type, description}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

impl EntityRecord {
    /// Convert into an [`Entity`], accepting only the given types
    pub fn into_entity(self, allowed: &[EntityType]) -> std::result::Result<Entity, CoreError> {
        let entity_type: EntityType = self.entity_type.parse()?;
        if !allowed.contains(&entity_type) {
            return Err(CoreError::Validation(format!(
                "entity type {} is not enabled",
                entity_type
            )));
        }
        if self.name.trim().chars().count() > MAX_NAME_LEN {
            return Err(CoreError::Validation("entity name too long".into()));
        }
        Entity::new(self.name, entity_type, self.description)
    }
}

impl ExtractionSchema for EntityRecord {
    const KIND: &'static str = "entity";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["name", "type", "description"],
            "properties": {
                "name": { "type": "string", "maxLength": MAX_NAME_LEN },
                "type": { "type": "string" },
                "description": { "type": "string" }
            }
        })
    }
}

/// `{source, target, type, description, strength?}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipRecord {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub strength: Option<f32>,
}

impl RelationshipRecord {
    pub fn into_relationship(self) -> std::result::Result<Relationship, CoreError> {
        if self.relation_type.trim().chars().count() > MAX_TYPE_LEN {
            return Err(CoreError::Validation("relationship type too long".into()));
        }
        let relationship =
            Relationship::new(self.source, self.target, self.relation_type, self.description)?;
        match self.strength {
            Some(strength) => relationship.with_strength(strength),
            None => Ok(relationship),
        }
    }
}

impl ExtractionSchema for RelationshipRecord {
    const KIND: &'static str = "relationship";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["source", "target", "type", "description"],
            "properties": {
                "source": { "type": "string", "maxLength": MAX_NAME_LEN },
                "target": { "type": "string", "maxLength": MAX_NAME_LEN },
                "type": { "type": "string", "maxLength": MAX_TYPE_LEN },
                "description": { "type": "string" },
                "strength": { "type": "number", "minimum": 0, "maximum": 1 }
            }
        })
    }
}

/// `{title, summary}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommunitySummaryRecord {
    pub title: String,
    pub summary: String,
}

impl ExtractionSchema for CommunitySummaryRecord {
    const KIND: &'static str = "community summary";

    fn json_schema() -> Value {
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["title", "summary"],
            "properties": {
                "title": { "type": "string" },
                "summary": { "type": "string" }
            }
        })
    }
}

/// Array schema wrapping `T`, capped at `max_items`
pub fn array_schema<T: ExtractionSchema>(max_items: usize) -> Value {
    json!({
        "type": "array",
        "maxItems": max_items,
        "items": T::json_schema(),
    })
}

/// Parse an array of records, skipping the ones that do not fit `T`.
///
/// Fails only when no array can be recovered at all.
pub fn parse_records<T: ExtractionSchema>(raw: &str) -> Result<Vec<T>> {
    let items = parse_json_array(raw)?;
    let total = items.len();

    let records: Vec<T> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<T>(item) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(kind = T::KIND, "Rejected record: {}", e);
                None
            }
        })
        .collect();

    if records.len() < total {
        debug!(
            kind = T::KIND,
            kept = records.len(),
            total,
            "Dropped malformed records"
        );
    }
    Ok(records)
}

/// Parse a single record
pub fn parse_record<T: ExtractionSchema>(raw: &str) -> Result<T> {
    let value = parse_json_object(raw)?;
    Ok(serde_json::from_value(value).map_err(CoreError::from)?)
}
