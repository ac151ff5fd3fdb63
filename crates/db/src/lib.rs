//! Storage layer for the graph knowledge base
//!
//! Defines the [`Store`]/[`GraphStore`] capability traits and ships two
//! backends: [`MemoryStore`] and the SurrealDB-backed [`SurrealStore`].

pub mod cluster;
pub mod error;
pub mod memory;
pub mod schema;
pub mod store;
pub mod surreal;

pub use error::{DbError, Result};
pub use memory::MemoryStore;
pub use store::{cosine_similarity, EntityDocumentMatch, GraphStore, Store};
pub use surreal::SurrealStore;

use surrealdb::engine::local::{Db, Mem};
use surrealdb::Surreal;

/// Database connection type
pub type DbConnection = Surreal<Db>;

/// Initialize database with RocksDB (persistent)
#[cfg(feature = "rocksdb")]
pub async fn init_persistent(path: impl AsRef<std::path::Path>) -> Result<DbConnection> {
    use surrealdb::engine::local::RocksDb;

    let db = Surreal::new::<RocksDb>(path.as_ref())
        .await
        .map_err(|e| DbError::Connection(e.to_string()))?;
    setup_database(&db).await?;
    Ok(db)
}

/// Initialize database in-memory
pub async fn init_memory() -> Result<DbConnection> {
    let db = Surreal::new::<Mem>(())
        .await
        .map_err(|e| DbError::Connection(e.to_string()))?;
    setup_database(&db).await?;
    Ok(db)
}

/// Setup database namespace, database, and schema
async fn setup_database(db: &DbConnection) -> Result<()> {
    db.use_ns(schema::NAMESPACE).use_db(schema::DATABASE).await?;
    schema::initialize_schema(db).await?;
    Ok(())
}
