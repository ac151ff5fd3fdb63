//! Core domain types for the graph knowledge base
//!
//! This crate defines the data structures shared by the store and the
//! retrieval engine: Documents, Entities, Relationships, Communities and
//! the search/clustering selectors.

pub mod community;
pub mod document;
pub mod entity;
pub mod error;
pub mod mode;
pub mod relationship;

pub use community::{
    ClusterMember, Community, DetectionReport, DetectionStatus, RawCommunity,
};
pub use document::{DocMetadata, Document};
pub use entity::{Entity, EntityType};
pub use error::{CoreError, Result};
pub use mode::{CommunityAlgorithm, SearchMode};
pub use relationship::Relationship;
