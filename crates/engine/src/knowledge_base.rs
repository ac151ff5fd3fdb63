//! Knowledge Base - ingestion, retrieval and community detection entry point

use crate::backend::StoreHandle;
use crate::community::{CommunityDetector, DetectionPhase};
use crate::concurrency::{cancellable, ensure_not_cancelled};
use crate::config::{AddOptions, DetectOptions, KnowledgeBaseConfig, SearchOptions};
use crate::entity::EntityExtractor;
use crate::inference::{embed_all, Embedder, Generator};
use crate::relationship::RelationshipExtractor;
use crate::search::SearchEngine;
use crate::{EngineError, Result};
use graphkb_core::{CommunityAlgorithm, DetectionReport, Document, SearchMode};
use graphkb_db::{GraphStore, Store};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// One-shot latch guarding the background detection launched by the first
/// successful ingestion
#[derive(Default)]
struct DetectionLatch {
    has_triggered_initial_detection: bool,
    handle: Option<JoinHandle<Result<DetectionReport>>>,
}

/// Builder for [`KnowledgeBase`]
pub struct KnowledgeBaseBuilder {
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    store: Option<StoreHandle>,
    config: KnowledgeBaseConfig,
}

impl KnowledgeBaseBuilder {
    /// Use a store without graph capability
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(StoreHandle::Vector(store));
        self
    }

    /// Use a graph-capable store
    pub fn graph_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(StoreHandle::Graph(store));
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn config(mut self, config: KnowledgeBaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration against the store's capabilities
    pub fn build(self) -> Result<KnowledgeBase> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| EngineError::Configuration("no store configured".into()))?;

        let config = self.config;
        if !store.is_graph_capable() {
            let wanted = [
                (config.enable_entity_extraction, "entity extraction"),
                (config.enable_relationship_extraction, "relationship extraction"),
                (config.enable_community_detection, "community detection"),
            ];
            if let Some((_, feature)) = wanted.iter().find(|(enabled, _)| *enabled) {
                return Err(EngineError::Configuration(format!(
                    "{} requires a graph-capable store",
                    feature
                )));
            }
        }

        let detector = store.graph().map(|graph| {
            Arc::new(
                CommunityDetector::new(graph.clone(), self.embedder.clone(), self.generator.clone())
                    .with_max_concurrency(config.max_concurrency),
            )
        });
        let search = SearchEngine::new(store.clone(), config.enable_community_detection);

        Ok(KnowledgeBase {
            embedder: self.embedder,
            generator: self.generator,
            store,
            search,
            detector,
            config,
            latch: Mutex::new(DetectionLatch::default()),
        })
    }
}

/// A graph-enhanced knowledge base over one store
pub struct KnowledgeBase {
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    store: StoreHandle,
    search: SearchEngine,
    detector: Option<Arc<CommunityDetector>>,
    config: KnowledgeBaseConfig,
    latch: Mutex<DetectionLatch>,
}

impl KnowledgeBase {
    pub fn builder(embedder: Arc<dyn Embedder>) -> KnowledgeBaseBuilder {
        KnowledgeBaseBuilder {
            embedder,
            generator: None,
            store: None,
            config: KnowledgeBaseConfig::default(),
        }
    }

    pub fn config(&self) -> &KnowledgeBaseConfig {
        &self.config
    }

    /// Phase of the community detector, if the store supports communities
    pub fn detection_phase(&self) -> Option<DetectionPhase> {
        self.detector.as_ref().map(|d| d.phase())
    }

    /// Embed, store and extract a batch of documents.
    ///
    /// Extraction is best effort: its failures are logged and the documents
    /// stay stored. Cancellation before the extracted graph is written
    /// discards it; once writing starts the whole graph is stored.
    #[instrument(skip_all, fields(documents = documents.len()))]
    pub async fn add_documents(&self, documents: Vec<Document>, options: &AddOptions) -> Result<()> {
        if self.config.needs_generator() && self.generator.is_none() {
            return Err(EngineError::Configuration(
                "entity or relationship extraction requires a text generator".into(),
            ));
        }
        if documents.is_empty() {
            return Ok(());
        }
        let cancel = options.cancel.as_ref();
        info!("Adding {} documents", documents.len());

        let documents = cancellable(cancel, self.embed_documents(documents)).await?;
        cancellable(cancel, async {
            self.store.add_documents(&documents).await?;
            Ok(())
        })
        .await?;
        debug!("Stored {} documents", documents.len());

        match self.extract_graph(&documents, cancel).await {
            Ok(()) => {}
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => error!("Graph extraction failed (non-fatal): {}", e),
        }

        self.trigger_initial_detection().await;
        Ok(())
    }

    async fn embed_documents(&self, documents: Vec<Document>) -> Result<Vec<Document>> {
        let pending: Vec<String> = documents
            .iter()
            .filter(|d| !d.has_embedding())
            .map(|d| d.text().to_string())
            .collect();
        if pending.is_empty() {
            return Ok(documents);
        }

        let mut embeddings = embed_all(self.embedder.as_ref(), &pending).await?.into_iter();
        Ok(documents
            .into_iter()
            .map(|doc| {
                if doc.has_embedding() {
                    return doc;
                }
                match embeddings.next() {
                    Some(embedding) => doc.with_embedding(embedding),
                    None => doc,
                }
            })
            .collect())
    }

    /// Entity and relationship extraction, persisted per document
    async fn extract_graph(
        &self,
        documents: &[Document],
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let (Some(store), Some(generator)) = (self.store.graph(), &self.generator) else {
            return Ok(());
        };
        if !self.config.enable_entity_extraction {
            return Ok(());
        }

        let extractor = EntityExtractor::new(generator.clone(), self.config.extraction.clone())
            .with_max_concurrency(self.config.max_concurrency);
        let mut extraction = extractor.extract(documents, cancel).await?;
        if extraction.is_empty() {
            debug!("No entities extracted");
            return Ok(());
        }

        if self.config.extraction.generate_entity_embeddings {
            let embedded =
                cancellable(cancel, extraction.attach_embeddings(self.embedder.as_ref())).await;
            match embedded {
                Ok(()) => {}
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => warn!("Entity embedding failed, storing entities without: {}", e),
            }
        }

        let relationships = if self.config.enable_relationship_extraction {
            RelationshipExtractor::new(Some(generator.clone()))
                .with_max_concurrency(self.config.max_concurrency)
                .extract(documents, &extraction.entities, cancel)
                .await?
        } else {
            Vec::new()
        };

        // past this point the batch is written in full or not at all
        ensure_not_cancelled(cancel)?;
        for doc in documents {
            let entities = extraction.entities_in(&doc.id);
            if !entities.is_empty() {
                store.add_entities(&entities, &doc.id).await?;
            }
        }
        if !relationships.is_empty() {
            store.add_relationships(&relationships).await?;
        }

        info!(
            entities = extraction.entities.len(),
            relationships = relationships.len(),
            "Stored extracted graph"
        );
        Ok(())
    }

    /// Launch background detection once per instance
    async fn trigger_initial_detection(&self) {
        if !self.config.enable_community_detection {
            return;
        }
        let Some(detector) = &self.detector else {
            return;
        };

        let mut latch = self.latch.lock().await;
        if latch.has_triggered_initial_detection {
            return;
        }
        latch.has_triggered_initial_detection = true;

        let detector = detector.clone();
        let algorithm = self.config.community_algorithm;
        info!(%algorithm, "Starting background community detection");
        latch.handle = Some(tokio::spawn(async move {
            detector.detect(algorithm, None).await
        }));
    }

    /// Await the background detection run, if one was launched and not yet
    /// awaited
    pub async fn wait_for_background_detection(&self) -> Option<Result<DetectionReport>> {
        let handle = self.latch.lock().await.handle.take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::GraphQuery(format!(
                "Background community detection did not finish: {}",
                e
            ))),
        })
    }

    /// Retrieve documents for a query
    #[instrument(skip(self, options))]
    pub async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        score_threshold: Option<f32>,
        mode: SearchMode,
        options: &SearchOptions,
    ) -> Result<Vec<Document>> {
        info!("Searching for: {}", query);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = cancellable(options.cancel.as_ref(), async {
            let mut embeddings = embed_all(self.embedder.as_ref(), &[query.to_string()]).await?;
            embeddings
                .pop()
                .ok_or_else(|| EngineError::Inference("no embedding for query".into()))
        })
        .await?;

        self.search
            .search(mode, &query_embedding, limit, score_threshold, options)
            .await
    }

    /// Detect communities now, replacing the stored ones
    #[instrument(skip(self, options))]
    pub async fn detect_communities(
        &self,
        algorithm: Option<CommunityAlgorithm>,
        options: &DetectOptions,
    ) -> Result<DetectionReport> {
        if !self.config.enable_community_detection {
            return Err(EngineError::Configuration(
                "community detection is disabled".into(),
            ));
        }
        let detector = self.detector.as_ref().ok_or_else(|| {
            EngineError::Configuration("community detection requires a graph-capable store".into())
        })?;

        let algorithm = algorithm.unwrap_or(self.config.community_algorithm);
        detector.detect(algorithm, options.cancel.as_ref()).await
    }
}
