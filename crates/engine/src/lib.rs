//! Graph knowledge base engine
//!
//! This crate turns documents into a searchable knowledge graph:
//! - KnowledgeBase: ingestion, retrieval and community detection
//! - EntityExtractor / RelationshipExtractor: LLM-driven graph extraction
//! - SearchEngine: vector, graph, hybrid and global retrieval
//! - CommunityDetector: clustering and summarization of the entity graph
//! - TeiClient / TgiClient: embedding and text-generation gateways

pub mod backend;
pub mod community;
mod concurrency;
pub mod config;
pub mod entity;
pub mod error;
pub mod inference;
mod json;
pub mod knowledge_base;
pub mod relationship;
pub mod schema;
pub mod search;

pub use backend::StoreHandle;
pub use community::{CommunityDetector, DetectionPhase};
pub use config::{AddOptions, DetectOptions, ExtractionConfig, KnowledgeBaseConfig, SearchOptions};
pub use entity::{EntityExtraction, EntityExtractor};
pub use error::{EngineError, Result};
pub use inference::{Embedder, Generator, TeiClient, TgiClient};
pub use knowledge_base::{KnowledgeBase, KnowledgeBaseBuilder};
pub use relationship::RelationshipExtractor;
pub use search::SearchEngine;

pub use tokio_util::sync::CancellationToken;
