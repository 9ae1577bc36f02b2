//! Phase input sources.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::time::timeout;

use crate::document::{Document, DocumentStream};
use crate::errors::Result;
use crate::store::DocumentStore;

use super::pipe::Pipe;

/// Time budget for the fast approximate count on a collection source.
/// When exceeded, the estimate is treated as unknown rather than blocking
/// the run.
pub const COUNT_BUDGET: Duration = Duration::from_secs(2);

/// Where a phase reads its documents from.
#[derive(Debug, Clone)]
pub enum Source {
    /// A durable collection, optionally filtered.
    Collection(CollectionSource),
    /// A database-side aggregation over a collection.
    Aggregation(AggregationSource),
    /// A JSON document-array file.
    File(FileSource),
    /// The streaming output of an upstream phase.
    Phase(Arc<Pipe>),
}

/// A collection source with an optional equality filter.
#[derive(Debug, Clone)]
pub struct CollectionSource {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
    /// Optional equality filter applied at the store.
    pub filter: Option<Document>,
}

impl CollectionSource {
    /// Creates an unfiltered collection source.
    #[must_use]
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            filter: None,
        }
    }
}

/// An aggregation-pipeline source.
#[derive(Debug, Clone)]
pub struct AggregationSource {
    /// Database name.
    pub database: String,
    /// Collection the pipeline starts from.
    pub collection: String,
    /// The aggregation pipeline stages.
    pub pipeline: Vec<Value>,
}

/// A JSON document-array file source.
#[derive(Debug, Clone)]
pub struct FileSource {
    /// Path to the file.
    pub path: PathBuf,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(src) => write!(f, "{}/{}", src.database, src.collection),
            Self::Aggregation(src) => write!(f, "aggregate({}/{})", src.database, src.collection),
            Self::File(src) => write!(f, "file://{}", src.path.display()),
            Self::Phase(_) => write!(f, "pipe"),
        }
    }
}

impl Source {
    /// Opens the source: returns a lazy document stream and, when cheaply
    /// known, an estimated total count for progress display.
    pub async fn cursor(
        &self,
        store: &Arc<dyn DocumentStore>,
    ) -> Result<(DocumentStream, Option<u64>)> {
        match self {
            Self::Collection(src) => {
                let stream = store
                    .find(&src.database, &src.collection, src.filter.as_ref())
                    .await?;
                let estimate =
                    match timeout(COUNT_BUDGET, store.estimated_count(&src.database, &src.collection))
                        .await
                    {
                        Ok(Ok(count)) => Some(count),
                        // Timed out or failed; unknown beats blocking the run.
                        _ => None,
                    };
                Ok((stream, estimate))
            }
            Self::Aggregation(src) => {
                let stream = store
                    .aggregate(&src.database, &src.collection, &src.pipeline)
                    .await?;
                Ok((stream, None))
            }
            Self::File(src) => {
                let raw = tokio::fs::read(&src.path).await?;
                let docs: Vec<Document> = serde_json::from_slice(&raw)?;
                let total = docs.len() as u64;
                Ok((stream::iter(docs.into_iter().map(Ok)).boxed(), Some(total)))
            }
            Self::Phase(pipe) => pipe.cursor().await,
        }
    }
}
