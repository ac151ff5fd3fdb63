//! Entity Extractor - pulls typed entities out of documents
//!
//! One generation call per document, optional gleaning rounds that ask for
//! what was missed, then case-insensitive resolution across the batch.

use crate::concurrency::bounded_fan_out;
use crate::config::ExtractionConfig;
use crate::inference::{embed_all, Embedder, Generator};
use crate::schema::{array_schema, parse_records, EntityRecord};
use crate::Result;
use graphkb_core::{Document, Entity, EntityType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Known names listed in a gleaning prompt
const MAX_GLEANING_NAMES: usize = 20;

/// Entities found in a batch, with the documents that mention them
#[derive(Debug, Clone, Default)]
pub struct EntityExtraction {
    /// Resolved entities, one per canonical name, in first-seen order
    pub entities: Vec<Entity>,

    /// Document id to the keys of the entities it mentions
    mentions: BTreeMap<String, BTreeSet<String>>,

    /// Documents whose extraction call failed
    pub failed_documents: Vec<String>,
}

impl EntityExtraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Resolved entities mentioned by one document
    pub fn entities_in(&self, document_id: &str) -> Vec<Entity> {
        let Some(keys) = self.mentions.get(document_id) else {
            return Vec::new();
        };
        self.entities
            .iter()
            .filter(|e| keys.contains(&e.key()))
            .cloned()
            .collect()
    }

    /// Embed every entity from `"{name} ({type}): {description}"`
    pub async fn attach_embeddings(&mut self, embedder: &dyn Embedder) -> Result<()> {
        if self.entities.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = self.entities.iter().map(Entity::embedding_text).collect();
        let embeddings = embed_all(embedder, &texts).await?;
        for (entity, embedding) in self.entities.iter_mut().zip(embeddings) {
            entity.embedding = Some(embedding);
        }
        debug!("Embedded {} entities", self.entities.len());
        Ok(())
    }
}

/// Extracts entities with the text-generation backend
pub struct EntityExtractor {
    generator: Arc<dyn Generator>,
    config: Arc<ExtractionConfig>,
    max_concurrency: usize,
}

impl EntityExtractor {
    pub fn new(generator: Arc<dyn Generator>, config: ExtractionConfig) -> Self {
        Self {
            generator,
            config: Arc::new(config),
            max_concurrency: 5,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Extract and resolve entities from a batch.
    ///
    /// A failing document contributes nothing; only cancellation fails the
    /// whole batch.
    #[instrument(skip(self, documents, cancel), fields(documents = documents.len()))]
    pub async fn extract(
        &self,
        documents: &[Document],
        cancel: Option<&CancellationToken>,
    ) -> Result<EntityExtraction> {
        let generator = self.generator.clone();
        let config = self.config.clone();
        let mut found: Vec<(usize, Result<Vec<Entity>>)> = bounded_fan_out(
            texts(documents, |_| true),
            self.max_concurrency,
            cancel,
            move |(index, text)| {
                let generator = generator.clone();
                let config = config.clone();
                async move {
                    let prompt = entity_prompt(&text, &config);
                    let result = generator
                        .generate(&prompt)
                        .await
                        .map(|response| validate(&response, &HashSet::new(), &config));
                    (index, result)
                }
            },
        )
        .await?;
        found.sort_by_key(|(index, _)| *index);

        let mut failed_documents = Vec::new();
        let mut first_pass: Vec<Vec<Entity>> = Vec::with_capacity(documents.len());
        for (index, result) in found {
            match result {
                Ok(entities) => first_pass.push(entities),
                Err(e) => {
                    warn!(document = %documents[index].id, "Entity extraction failed: {}", e);
                    failed_documents.push(documents[index].id.clone());
                    first_pass.push(Vec::new());
                }
            }
        }

        let mut gleaned: Vec<Vec<Entity>> = vec![Vec::new(); documents.len()];
        if self.config.enable_gleanings {
            for round in 0..self.config.gleanings_rounds {
                let added = self
                    .glean(documents, &first_pass, &mut gleaned, &failed_documents, cancel)
                    .await?;
                debug!(round = round + 1, added, "Gleaning round finished");
            }
        }

        let extraction = resolve(documents, [first_pass, gleaned], failed_documents);
        info!(
            entities = extraction.entities.len(),
            failed = extraction.failed_documents.len(),
            "Entity extraction finished"
        );
        Ok(extraction)
    }

    /// One gleaning round over every document that did not fail
    async fn glean(
        &self,
        documents: &[Document],
        first_pass: &[Vec<Entity>],
        gleaned: &mut [Vec<Entity>],
        failed_documents: &[String],
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let mut known_keys: HashSet<String> = HashSet::new();
        let mut known_names: Vec<String> = Vec::new();
        for entity in first_pass.iter().chain(gleaned.iter()).flatten() {
            if known_keys.insert(entity.key()) {
                known_names.push(entity.name.clone());
            }
        }
        known_names.truncate(MAX_GLEANING_NAMES);

        let known_keys = Arc::new(known_keys);
        let known_names = Arc::new(known_names);
        let generator = self.generator.clone();
        let config = self.config.clone();

        let results: Vec<(usize, Result<Vec<Entity>>)> = bounded_fan_out(
            texts(documents, |doc| !failed_documents.contains(&doc.id)),
            self.max_concurrency,
            cancel,
            move |(index, text)| {
                let generator = generator.clone();
                let config = config.clone();
                let known_keys = known_keys.clone();
                let known_names = known_names.clone();
                async move {
                    let prompt = gleaning_prompt(&text, &known_names, &config);
                    let result = generator
                        .generate(&prompt)
                        .await
                        .map(|response| validate(&response, &known_keys, &config));
                    (index, result)
                }
            },
        )
        .await?;

        let mut added = 0;
        for (index, result) in results {
            match result {
                Ok(entities) => {
                    added += entities.len();
                    gleaned[index].extend(entities);
                }
                Err(e) => {
                    warn!(document = %documents[index].id, "Gleaning failed: {}", e);
                }
            }
        }
        Ok(added)
    }
}

/// Owned `(position, text)` pairs for the documents passing `keep`
fn texts(documents: &[Document], keep: impl Fn(&Document) -> bool) -> Vec<(usize, String)> {
    documents
        .iter()
        .enumerate()
        .filter(|(_, doc)| keep(doc))
        .map(|(index, doc)| (index, doc.text().to_string()))
        .collect()
}

/// Parse and validate a response, dropping names in `known`
fn validate(response: &str, known: &HashSet<String>, config: &ExtractionConfig) -> Vec<Entity> {
    let records: Vec<EntityRecord> = match parse_records(response) {
        Ok(records) => records,
        Err(e) => {
            warn!("Unparseable entity output: {}", e);
            return Vec::new();
        }
    };

    records
        .into_iter()
        .filter(|record| !known.contains(&Entity::canonicalize(&record.name)))
        .filter_map(|record| match record.into_entity(&config.entity_types) {
            Ok(entity) => Some(entity),
            Err(e) => {
                debug!("Discarded entity record: {}", e);
                None
            }
        })
        .take(config.max_entities_per_chunk)
        .collect()
}

/// Collapse per-document entities into one entity per canonical name.
///
/// Passes are walked in order, so first-pass names come before gleaned
/// ones. The first occurrence names the entity; type and description come
/// from the occurrence with the longest description.
fn resolve<const N: usize>(
    documents: &[Document],
    passes: [Vec<Vec<Entity>>; N],
    failed_documents: Vec<String>,
) -> EntityExtraction {
    let mut entities: Vec<Entity> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut mentions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for per_document in passes {
        for (doc, found) in documents.iter().zip(per_document) {
            for entity in found {
                let key = entity.key();
                mentions
                    .entry(doc.id.clone())
                    .or_default()
                    .insert(key.clone());

                match positions.get(&key) {
                    Some(&position) => {
                        let survivor = &mut entities[position];
                        if entity.description.chars().count()
                            > survivor.description.chars().count()
                        {
                            survivor.entity_type = entity.entity_type;
                            survivor.description = entity.description;
                        }
                    }
                    None => {
                        positions.insert(key, entities.len());
                        entities.push(entity);
                    }
                }
            }
        }
    }

    EntityExtraction {
        entities,
        mentions,
        failed_documents,
    }
}

fn type_list(types: &[EntityType]) -> String {
    types
        .iter()
        .map(EntityType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn entity_prompt(text: &str, config: &ExtractionConfig) -> String {
    format!(
        "Extract key entities from the following text.\n\
         Allowed types: {types}.\n\
         Return a JSON array of at most {max} objects matching this schema, and nothing else:\n\
         {schema}\n\n\
         Text:\n{text}",
        types = type_list(&config.entity_types),
        max = config.max_entities_per_chunk,
        schema = array_schema::<EntityRecord>(config.max_entities_per_chunk),
        text = text,
    )
}

fn gleaning_prompt(text: &str, known: &[String], config: &ExtractionConfig) -> String {
    format!(
        "Some entities in the text below may have been missed.\n\
         You already extracted: {known}.\n\
         List only entities that are not in that list.\n\
         Allowed types: {types}.\n\
         Return a JSON array of at most {max} objects matching this schema, and nothing else:\n\
         {schema}\n\n\
         Text:\n{text}",
        known = known.join(", "),
        types = type_list(&config.entity_types),
        max = config.max_entities_per_chunk,
        schema = array_schema::<EntityRecord>(config.max_entities_per_chunk),
        text = text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers by matching the document text in the prompt
    struct Scripted {
        calls: AtomicUsize,
        gleanings: AtomicUsize,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gleanings: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.contains("You already extracted") {
                self.gleanings.fetch_add(1, Ordering::SeqCst);
                return Ok(
                    r#"[{"name": "OPENAI", "type": "ORG", "description": "dup"},
                        {"name": "San Francisco", "type": "LOCATION", "description": "city"}]"#
                        .into(),
                );
            }
            if prompt.contains("broken document") {
                return Err(EngineError::Inference("backend exploded".into()));
            }
            if prompt.contains("first document") {
                return Ok(r#"[{"name": "OpenAI", "type": "ORG", "description": "co"}]"#.into());
            }
            Ok(r#"Sure! ```json
[{"name": "openai", "type": "ORG", "description": "company based in SF"},
 {"name": "Alice", "type": "PERSON", "description": "researcher"},
 {"name": "Mars", "type": "PLANET", "description": "not allowed"}]
```"#
                .into())
        }
    }

    fn docs() -> Vec<Document> {
        vec![
            Document::new("d1", "first document"),
            Document::new("d2", "broken document"),
            Document::new("d3", "third document"),
        ]
    }

    #[tokio::test]
    async fn test_dedup_keeps_longer_description() {
        let extractor = EntityExtractor::new(Arc::new(Scripted::new()), ExtractionConfig::default());
        let extraction = extractor.extract(&docs(), None).await.unwrap();

        assert_eq!(extraction.entities.len(), 2);
        let openai = &extraction.entities[0];
        assert_eq!(openai.name, "OpenAI");
        assert_eq!(openai.description, "company based in SF");
        assert_eq!(extraction.failed_documents, vec!["d2".to_string()]);
    }

    #[tokio::test]
    async fn test_mentions_follow_documents() {
        let extractor = EntityExtractor::new(Arc::new(Scripted::new()), ExtractionConfig::default());
        let extraction = extractor.extract(&docs(), None).await.unwrap();

        let names = |id: &str| -> Vec<String> {
            extraction.entities_in(id).into_iter().map(|e| e.name).collect()
        };
        assert_eq!(names("d1"), vec!["OpenAI"]);
        assert!(names("d2").is_empty());
        assert_eq!(names("d3"), vec!["OpenAI", "Alice"]);
    }

    #[tokio::test]
    async fn test_gleaning_adds_only_new_names() {
        let generator = Arc::new(Scripted::new());
        let config = ExtractionConfig {
            enable_gleanings: true,
            gleanings_rounds: 1,
            ..ExtractionConfig::default()
        };
        let extractor = EntityExtractor::new(generator.clone(), config);
        let extraction = extractor.extract(&docs(), None).await.unwrap();

        let names: Vec<&str> = extraction.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["OpenAI", "Alice", "San Francisco"]);
        // the failed document is not gleaned
        assert_eq!(generator.gleanings.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_longer_description_counts_characters() {
        let documents = vec![Document::new("d1", "a"), Document::new("d2", "b")];
        let first = vec![
            vec![Entity::new("Zürich", EntityType::Location, "city").unwrap()],
            vec![Entity::new("zürich", EntityType::Org, "ééé").unwrap()],
        ];

        let extraction = resolve(&documents, [first], Vec::new());
        assert_eq!(extraction.entities.len(), 1);
        assert_eq!(extraction.entities[0].name, "Zürich");
        assert_eq!(extraction.entities[0].description, "city");
        assert_eq!(extraction.entities[0].entity_type, EntityType::Location);
    }

    #[tokio::test]
    async fn test_entity_cap_per_document() {
        let config = ExtractionConfig {
            max_entities_per_chunk: 1,
            ..ExtractionConfig::default()
        };
        let extractor = EntityExtractor::new(Arc::new(Scripted::new()), config);
        let extraction = extractor
            .extract(&[Document::new("d3", "third document")], None)
            .await
            .unwrap();
        assert_eq!(extraction.entities.len(), 1);
    }

    #[test]
    fn test_prompt_shape() {
        let config = ExtractionConfig::default();
        let prompt = entity_prompt("Alice works at OpenAI.", &config);
        assert!(prompt.starts_with("Extract key entities"));
        assert!(prompt.contains("PERSON, ORG"));
        assert!(prompt.ends_with("Text:\nAlice works at OpenAI."));

        let known: Vec<String> = vec!["Alice".into()];
        let glean = gleaning_prompt("text", &known, &config);
        assert!(glean.contains("You already extracted: Alice."));
    }
}
