//! Relationship Extractor - typed links between already-known entities

use crate::concurrency::bounded_fan_out;
use crate::inference::Generator;
use crate::schema::{array_schema, parse_records, RelationshipRecord};
use crate::Result;
use graphkb_core::{Document, Entity, Relationship};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Known entity names listed in the prompt
const MAX_PROMPT_ENTITIES: usize = 50;

/// Relationships returned per document
const MAX_RELATIONSHIPS_PER_DOCUMENT: usize = 20;

/// Extracts relationships between known entities
pub struct RelationshipExtractor {
    generator: Option<Arc<dyn Generator>>,
    max_concurrency: usize,
}

impl RelationshipExtractor {
    pub fn new(generator: Option<Arc<dyn Generator>>) -> Self {
        Self {
            generator,
            max_concurrency: 5,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Extract deduplicated relationships.
    ///
    /// Without a generator or without entities there is nothing to relate,
    /// and the result is empty.
    #[instrument(skip_all, fields(documents = documents.len(), entities = entities.len()))]
    pub async fn extract(
        &self,
        documents: &[Document],
        entities: &[Entity],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Relationship>> {
        let Some(generator) = self.generator.clone() else {
            debug!("No generator configured, skipping relationship extraction");
            return Ok(Vec::new());
        };
        if entities.is_empty() || documents.is_empty() {
            return Ok(Vec::new());
        }

        let canonical: Arc<HashMap<String, String>> = Arc::new(
            entities
                .iter()
                .map(|e| (e.key(), e.name.clone()))
                .collect(),
        );
        let names: Arc<Vec<String>> = Arc::new(
            entities
                .iter()
                .take(MAX_PROMPT_ENTITIES)
                .map(|e| e.name.clone())
                .collect(),
        );
        let items: Vec<(usize, String, String)> = documents
            .iter()
            .enumerate()
            .map(|(index, doc)| (index, doc.id.clone(), doc.text().to_string()))
            .collect();

        let mut found: Vec<(usize, Vec<Relationship>)> = bounded_fan_out(
            items,
            self.max_concurrency,
            cancel,
            move |(index, id, text)| {
                let generator = generator.clone();
                let canonical = canonical.clone();
                let names = names.clone();
                async move {
                    let prompt = relationship_prompt(&text, &names);
                    let relationships = match generator.generate(&prompt).await {
                        Ok(response) => validate(&response, &canonical),
                        Err(e) => {
                            warn!(document = %id, "Relationship extraction failed: {}", e);
                            Vec::new()
                        }
                    };
                    (index, relationships)
                }
            },
        )
        .await?;
        found.sort_by_key(|(index, _)| *index);

        let relationships = dedup(found.into_iter().flat_map(|(_, rels)| rels));
        info!(
            relationships = relationships.len(),
            "Relationship extraction finished"
        );
        Ok(relationships)
    }
}

/// Parse a response and keep the records whose endpoints are known,
/// rewritten to the entities' display names
fn validate(response: &str, canonical: &HashMap<String, String>) -> Vec<Relationship> {
    let records: Vec<RelationshipRecord> = match parse_records(response) {
        Ok(records) => records,
        Err(e) => {
            warn!("Unparseable relationship output: {}", e);
            return Vec::new();
        }
    };

    records
        .into_iter()
        .filter_map(|record| {
            let source = canonical.get(&Entity::canonicalize(&record.source))?;
            let target = canonical.get(&Entity::canonicalize(&record.target))?;
            let record = RelationshipRecord {
                source: source.clone(),
                target: target.clone(),
                ..record
            };
            match record.into_relationship() {
                Ok(rel) => Some(rel),
                Err(e) => {
                    debug!("Discarded relationship record: {}", e);
                    None
                }
            }
        })
        .take(MAX_RELATIONSHIPS_PER_DOCUMENT)
        .collect()
}

/// One relationship per `(source, target, type)`, keeping the longer
/// description and the higher strength
fn dedup(relationships: impl IntoIterator<Item = Relationship>) -> Vec<Relationship> {
    let mut kept: Vec<Relationship> = Vec::new();
    let mut positions: HashMap<(String, String, String), usize> = HashMap::new();

    for rel in relationships {
        match positions.get(&rel.key()) {
            Some(&position) => {
                let survivor = &mut kept[position];
                if rel.description.chars().count() > survivor.description.chars().count() {
                    survivor.description = rel.description;
                }
                survivor.strength = survivor.strength.max(rel.strength);
            }
            None => {
                positions.insert(rel.key(), kept.len());
                kept.push(rel);
            }
        }
    }
    kept
}

fn relationship_prompt(text: &str, names: &[String]) -> String {
    format!(
        "Identify relationships between the entities below as they appear in the text.\n\
         Known entities: {names}\n\
         Use only these entities as source and target.\n\
         Return a JSON array of at most {max} objects matching this schema, and nothing else:\n\
         {schema}\n\n\
         Text:\n{text}",
        names = names.join(", "),
        max = MAX_RELATIONSHIPS_PER_DOCUMENT,
        schema = array_schema::<RelationshipRecord>(MAX_RELATIONSHIPS_PER_DOCUMENT),
        text = text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use async_trait::async_trait;
    use graphkb_core::EntityType;

    struct Scripted;

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, prompt: &str) -> Result<String> {
            if prompt.contains("Text:\nfails") {
                return Err(EngineError::Inference("timeout".into()));
            }
            Ok(r#"[
                {"source": "Alice", "target": "OpenAI", "type": "works for", "description": "job"},
                {"source": "alice", "target": "openai", "type": "WORKS_FOR", "description": "longer job text"},
                {"source": "Alice", "target": "Nobody", "type": "KNOWS", "description": ""},
                {"source": "Alice", "target": "OpenAI", "type": "", "description": "untyped"}
            ]"#
            .into())
        }
    }

    fn entities() -> Vec<Entity> {
        vec![
            Entity::new("Alice", EntityType::Person, "researcher").unwrap(),
            Entity::new("OpenAI", EntityType::Org, "lab").unwrap(),
        ]
    }

    #[tokio::test]
    async fn test_dedup_and_normalization() {
        let extractor = RelationshipExtractor::new(Some(Arc::new(Scripted)));
        let docs = vec![Document::new("d1", "Alice works at OpenAI.")];
        let rels = extractor.extract(&docs, &entities(), None).await.unwrap();

        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].source, "Alice");
        assert_eq!(rels[0].target, "OpenAI");
        assert_eq!(rels[0].relation_type, "WORKS_FOR");
        assert_eq!(rels[0].description, "longer job text");
    }

    #[tokio::test]
    async fn test_failing_document_is_isolated() {
        let extractor = RelationshipExtractor::new(Some(Arc::new(Scripted)));
        let docs = vec![
            Document::new("d1", "fails"),
            Document::new("d2", "Alice works at OpenAI."),
        ];
        let rels = extractor.extract(&docs, &entities(), None).await.unwrap();
        assert_eq!(rels.len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_relate() {
        let docs = vec![Document::new("d1", "text")];

        let without_generator = RelationshipExtractor::new(None);
        assert!(without_generator
            .extract(&docs, &entities(), None)
            .await
            .unwrap()
            .is_empty());

        let without_entities = RelationshipExtractor::new(Some(Arc::new(Scripted)));
        assert!(without_entities
            .extract(&docs, &[], None)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dedup_compares_description_characters() {
        let rels = dedup(vec![
            Relationship::new("Alice", "Zürich", "LIVES_IN", "home").unwrap(),
            Relationship::new("Alice", "Zürich", "LIVES_IN", "ééé").unwrap(),
        ]);
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].description, "home");
    }

    #[test]
    fn test_prompt_lists_at_most_fifty_names() {
        let names: Vec<String> = (0..80).map(|i| format!("entity{}", i)).collect();
        let prompt = relationship_prompt("text", &names[..MAX_PROMPT_ENTITIES]);
        assert!(prompt.contains("Known entities: entity0, entity1"));
        assert!(prompt.contains("entity49"));
        assert!(!prompt.contains("entity50"));
    }
}
