//! SurrealDB schema definitions

use crate::{DbConnection, DbError, Result};
use tracing::info;

/// Namespace and database the store lives in
pub const NAMESPACE: &str = "graphkb";
pub const DATABASE: &str = "kb";

/// Initialize the database schema
pub async fn initialize_schema(db: &DbConnection) -> Result<()> {
    info!("Initializing database schema...");

    db.query(SCHEMA_DEFINITION)
        .await?
        .check()
        .map_err(|e| DbError::SchemaInit(e.to_string()))?;

    info!("Schema initialized successfully");
    Ok(())
}

// Embedding dimension depends on the configured model, so no vector index is
// declared; similarity is computed with vector::similarity::cosine.
const SCHEMA_DEFINITION: &str = r#"
-- ============================================
-- TABLES
-- ============================================

-- Document chunks
DEFINE TABLE IF NOT EXISTS document SCHEMALESS;

-- Entities, record id is the canonical name
DEFINE TABLE IF NOT EXISTS entity SCHEMALESS;

-- Mention counts, record id is [document key, entity key]
DEFINE TABLE IF NOT EXISTS mention SCHEMALESS;

-- Relationships, record id is [source key, target key, type]
DEFINE TABLE IF NOT EXISTS relation SCHEMALESS;

-- Community summaries
DEFINE TABLE IF NOT EXISTS community SCHEMALESS;

-- ============================================
-- INDEXES
-- ============================================

DEFINE INDEX IF NOT EXISTS idx_document_key ON document FIELDS key UNIQUE;

DEFINE INDEX IF NOT EXISTS idx_entity_key ON entity FIELDS key UNIQUE;
DEFINE INDEX IF NOT EXISTS idx_entity_type ON entity FIELDS entity_type;

DEFINE INDEX IF NOT EXISTS idx_mention_entity ON mention FIELDS entity;
DEFINE INDEX IF NOT EXISTS idx_mention_document ON mention FIELDS document;

DEFINE INDEX IF NOT EXISTS idx_relation_source ON relation FIELDS source_key;
DEFINE INDEX IF NOT EXISTS idx_relation_target ON relation FIELDS target_key;

DEFINE INDEX IF NOT EXISTS idx_community_level ON community FIELDS level;
"#;

#[cfg(test)]
mod tests {
    use crate::init_memory;

    #[tokio::test]
    async fn test_schema_initialization() {
        let db = init_memory().await.expect("Failed to init db");

        let documents: Vec<serde_json::Value> = db.select("document").await.unwrap();
        assert!(documents.is_empty());

        let entities: Vec<serde_json::Value> = db.select("entity").await.unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn test_schema_is_reentrant() {
        let db = init_memory().await.unwrap();
        super::initialize_schema(&db).await.unwrap();
    }
}
