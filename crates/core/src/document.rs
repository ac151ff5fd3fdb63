//! Document types - the retrievable units of content

use serde::{Deserialize, Serialize};

/// Where a document chunk came from and what it says
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMetadata {
    /// Identifier of the source document this chunk belongs to
    pub doc_id: String,

    /// Position of this chunk within the source document
    pub chunk_id: usize,

    /// Number of chunks the source document was split into
    pub total_chunks: usize,

    /// The chunk text
    pub content: String,
}

/// A document chunk as stored and retrieved by the knowledge base
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier; re-ingesting the same id overwrites
    pub id: String,

    /// Vector embedding, absent until the document is embedded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    pub metadata: DocMetadata,

    /// Relevance score, only set on retrieval results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Document {
    /// Create a single-chunk document
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            metadata: DocMetadata {
                doc_id: id.clone(),
                chunk_id: 0,
                total_chunks: 1,
                content: content.into(),
            },
            id,
            embedding: None,
            score: None,
        }
    }

    /// Create one chunk of a larger source document
    pub fn chunk(
        id: impl Into<String>,
        doc_id: impl Into<String>,
        chunk_id: usize,
        total_chunks: usize,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            embedding: None,
            metadata: DocMetadata {
                doc_id: doc_id.into(),
                chunk_id,
                total_chunks,
                content: content.into(),
            },
            score: None,
        }
    }

    /// Builder pattern: set embedding
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Builder pattern: attach a retrieval score
    pub fn with_score(mut self, score: f32) -> Self {
        self.score = Some(score);
        self
    }

    /// The chunk text
    pub fn text(&self) -> &str {
        &self.metadata.content
    }

    /// Check if document has an embedding
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_creation() {
        let doc = Document::new("doc-1", "Alice works at OpenAI.");

        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.metadata.doc_id, "doc-1");
        assert_eq!(doc.metadata.total_chunks, 1);
        assert_eq!(doc.text(), "Alice works at OpenAI.");
        assert!(!doc.has_embedding());
        assert!(doc.score.is_none());
    }

    #[test]
    fn test_chunk_with_embedding() {
        let doc = Document::chunk("report#2", "report", 2, 5, "Quarterly numbers")
            .with_embedding(vec![0.1, 0.2]);

        assert_eq!(doc.metadata.chunk_id, 2);
        assert_eq!(doc.metadata.total_chunks, 5);
        assert!(doc.has_embedding());
    }

    #[test]
    fn test_score_is_not_serialized_when_absent() {
        let doc = Document::new("d", "text");
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("score").is_none());
        assert!(json.get("embedding").is_none());
    }
}
