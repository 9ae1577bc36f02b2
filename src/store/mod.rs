//! The document database boundary.
//!
//! The engine never talks to a driver directly; everything goes through the
//! [`DocumentStore`] trait. [`MemoryStore`] is the in-process implementation
//! used by tests and embedders that want to dry-run a migration.

mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::document::{Document, DocumentStream};
use crate::errors::Result;

pub use memory::MemoryStore;

/// Capability contract for a document database.
///
/// Implementations are shared across all concurrent phase tasks behind an
/// `Arc`; connection pooling is the implementation's concern.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Streams documents matching an equality filter (all documents when
    /// `filter` is `None`).
    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Option<&Document>,
    ) -> Result<DocumentStream>;

    /// Fast, approximate document count. Callers bound this with their own
    /// time budget and treat a timeout as "unknown".
    async fn estimated_count(&self, database: &str, collection: &str) -> Result<u64>;

    /// Runs an aggregation pipeline against a collection and streams the
    /// result documents.
    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<DocumentStream>;

    /// Writes a batch of documents as idempotent upserts keyed by `_id`.
    /// Documents without an `_id` are inserted.
    async fn bulk_upsert(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<()>;

    /// Applies a `$set`/`$addToSet` update to the first document matching
    /// `filter`, inserting one when `upsert` is set and none matches.
    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<()>;

    /// Creates an index over the given key specification; returns its name.
    async fn create_index(&self, database: &str, collection: &str, keys: &Document)
        -> Result<String>;

    /// Renames a collection within its database.
    async fn rename_collection(
        &self,
        database: &str,
        collection: &str,
        new_name: &str,
    ) -> Result<()>;

    /// Drops a collection.
    async fn drop_collection(&self, database: &str, collection: &str) -> Result<()>;
}
