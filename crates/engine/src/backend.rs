//! Capability-tagged handle over the configured store

use graphkb_core::Document;
use graphkb_db::{GraphStore, Store};
use std::sync::Arc;

/// The store a knowledge base runs against, tagged by what it can do
#[derive(Clone)]
pub enum StoreHandle {
    /// Documents and similarity search only
    Vector(Arc<dyn Store>),
    /// Full graph capability
    Graph(Arc<dyn GraphStore>),
}

impl StoreHandle {
    /// The graph capability, if this backend has it
    pub fn graph(&self) -> Option<&Arc<dyn GraphStore>> {
        match self {
            StoreHandle::Vector(_) => None,
            StoreHandle::Graph(store) => Some(store),
        }
    }

    pub fn is_graph_capable(&self) -> bool {
        self.graph().is_some()
    }

    pub async fn add_documents(&self, documents: &[Document]) -> graphkb_db::Result<()> {
        match self {
            StoreHandle::Vector(store) => store.add_documents(documents).await,
            StoreHandle::Graph(store) => store.add_documents(documents).await,
        }
    }

    pub async fn search_documents(
        &self,
        query_embedding: &[f32],
        limit: usize,
        threshold: Option<f32>,
    ) -> graphkb_db::Result<Vec<Document>> {
        match self {
            StoreHandle::Vector(store) => {
                store.search_documents(query_embedding, limit, threshold).await
            }
            StoreHandle::Graph(store) => {
                store.search_documents(query_embedding, limit, threshold).await
            }
        }
    }
}
