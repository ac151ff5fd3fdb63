//! Community Detector - clusters the entity graph and summarizes each cluster
//!
//! A run moves through `Clustering -> Summarizing -> Embedding -> Persisting`
//! and back to `Idle`, or ends in `Failed`. Nothing is written to the store
//! before the final phase, so a failed run leaves prior communities intact.
//! A successful run replaces every stored level.

use crate::concurrency::{bounded_fan_out, ensure_not_cancelled};
use crate::inference::{embed_all, Embedder, Generator};
use crate::schema::{parse_record, CommunitySummaryRecord, ExtractionSchema};
use crate::{EngineError, Result};
use graphkb_core::{Community, CommunityAlgorithm, DetectionReport, RawCommunity};
use graphkb_db::GraphStore;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const MAX_PROMPT_NAMES: usize = 20;
const MAX_PROMPT_DESCRIPTIONS: usize = 10;

/// Where a detection run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionPhase {
    Idle,
    Clustering,
    Summarizing,
    Embedding,
    Persisting,
    Failed,
}

impl fmt::Display for DetectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetectionPhase::Idle => "idle",
            DetectionPhase::Clustering => "clustering",
            DetectionPhase::Summarizing => "summarizing",
            DetectionPhase::Embedding => "embedding",
            DetectionPhase::Persisting => "persisting",
            DetectionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Detects, summarizes and stores entity communities
pub struct CommunityDetector {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    generator: Option<Arc<dyn Generator>>,
    max_concurrency: usize,
    phase: watch::Sender<DetectionPhase>,
}

impl CommunityDetector {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Self {
        let (phase, _) = watch::channel(DetectionPhase::Idle);
        Self {
            store,
            embedder,
            generator,
            max_concurrency: 5,
            phase,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Current phase
    pub fn phase(&self) -> DetectionPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions
    pub fn subscribe(&self) -> watch::Receiver<DetectionPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: DetectionPhase) {
        debug!(%phase, "Community detection phase");
        self.phase.send_replace(phase);
    }

    /// Run a full detection pass, replacing the stored communities
    #[instrument(skip(self, cancel))]
    pub async fn detect(
        &self,
        algorithm: CommunityAlgorithm,
        cancel: Option<&CancellationToken>,
    ) -> Result<DetectionReport> {
        match self.run(algorithm, cancel).await {
            Ok(report) => {
                self.enter(DetectionPhase::Idle);
                info!(
                    communities = report.community_count,
                    levels = report.levels,
                    status = %report.status,
                    "Community detection finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.enter(DetectionPhase::Failed);
                error!("Community detection failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        algorithm: CommunityAlgorithm,
        cancel: Option<&CancellationToken>,
    ) -> Result<DetectionReport> {
        ensure_not_cancelled(cancel)?;

        self.enter(DetectionPhase::Clustering);
        let raw = self
            .store
            .run_clustering(algorithm)
            .await
            .map_err(graph_failure)?;
        if raw.is_empty() {
            info!("No communities found");
            return Ok(DetectionReport::from_communities(&[], algorithm));
        }
        debug!("Clustering produced {} raw communities", raw.len());

        self.enter(DetectionPhase::Summarizing);
        let mut communities = self.summarize(raw, cancel).await?;
        communities.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));

        ensure_not_cancelled(cancel)?;
        self.enter(DetectionPhase::Embedding);
        let summaries: Vec<String> = communities.iter().map(|c| c.summary.clone()).collect();
        let embeddings = embed_all(self.embedder.as_ref(), &summaries)
            .await
            .map_err(|e| match e {
                EngineError::Cancelled => e,
                other => graph_failure(other),
            })?;
        let communities: Vec<Community> = communities
            .into_iter()
            .zip(embeddings)
            .map(|(community, embedding)| community.with_embedding(embedding))
            .collect();

        ensure_not_cancelled(cancel)?;
        self.enter(DetectionPhase::Persisting);
        self.store
            .replace_communities(&communities)
            .await
            .map_err(graph_failure)?;

        Ok(DetectionReport::from_communities(&communities, algorithm))
    }

    async fn summarize(
        &self,
        raw: Vec<RawCommunity>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Community>> {
        let Some(generator) = self.generator.clone() else {
            debug!("No generator configured, using synthetic summaries");
            return Ok(raw.iter().map(Community::fallback).collect());
        };

        bounded_fan_out(raw, self.max_concurrency, cancel, move |community| {
            let generator = generator.clone();
            async move { summarize_one(generator, community).await }
        })
        .await
    }
}

async fn summarize_one(generator: Arc<dyn Generator>, community: RawCommunity) -> Community {
    let prompt = summary_prompt(&community);
    let response = match generator.generate(&prompt).await {
        Ok(response) => response,
        Err(e) => {
            warn!(community = %community.community_id(), "Summary generation failed: {}", e);
            return Community::fallback(&community);
        }
    };
    match parse_record::<CommunitySummaryRecord>(&response) {
        Ok(record) => Community::summarized(&community, &record.title, &record.summary),
        Err(e) => {
            warn!(
                community = %community.community_id(),
                kind = CommunitySummaryRecord::KIND,
                "Unparseable summary, using fallback: {}",
                e
            );
            Community::fallback(&community)
        }
    }
}

fn graph_failure(e: impl fmt::Display) -> EngineError {
    EngineError::GraphQuery(format!("Community detection failed: {}", e))
}

fn summary_prompt(community: &RawCommunity) -> String {
    let names = community
        .members
        .iter()
        .take(MAX_PROMPT_NAMES)
        .map(|m| m.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let descriptions = community
        .members
        .iter()
        .filter(|m| !m.description.is_empty())
        .take(MAX_PROMPT_DESCRIPTIONS)
        .map(|m| format!("- {}: {}", m.name, m.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Summarize the following group of related entities.\n\
         Entities: {names}\n\
         Descriptions:\n{descriptions}\n\n\
         Give a short title and a 2-3 sentence summary of what connects them.\n\
         Return one JSON object matching this schema, and nothing else:\n\
         {schema}",
        names = names,
        descriptions = descriptions,
        schema = CommunitySummaryRecord::json_schema(),
    )
}
