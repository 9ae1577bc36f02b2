//! Transform operations: the work a phase performs between its source and
//! its destination.
//!
//! `Operation` is a closed set of variants dispatched through a narrow
//! surface: `invoke`, the capability flags used for pre-run validation, and
//! the auto-wiring factories consulted when one phase feeds another.

mod aggregation;
mod collection;
mod transfer;
mod transform;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::document::Document;
use crate::engine::ProgressSink;
use crate::errors::{ConfigurationError, MongrationError, Result};
use crate::io::{CollectionDestination, CollectionSource, Destination, Pipe, Source, Writer};
use crate::phase::PhaseHandle;
use crate::store::DocumentStore;

pub use aggregation::{AggregationOperation, StreamingAggregationOperation};
pub use collection::{DropCollectionOperation, IndexOperation, RenameCollectionOperation};
pub use transfer::{ExportOperation, ImportOperation};
pub use transform::TransformOperation;

/// Per-document transform callback.
pub type TransformFn = Arc<dyn Fn(Document) -> anyhow::Result<Document> + Send + Sync>;

/// Per-document consumer callback (export).
pub type ExportFn = Arc<dyn Fn(Document) -> anyhow::Result<()> + Send + Sync>;

/// Documents processed between voluntary yields in tight per-document
/// loops, so one phase's synchronous work cannot starve its siblings on
/// the cooperative scheduler.
pub const YIELD_BATCH: usize = 64;

/// Default batch size for the streaming sub-aggregation operation.
pub const DEFAULT_STREAM_BATCH: usize = 4096;

/// Everything an operation needs at invocation time.
pub struct InvokeContext<'a> {
    /// Shared database handle.
    pub store: &'a Arc<dyn DocumentStore>,
    /// Progress sink updated per document.
    pub progress: &'a dyn ProgressSink,
    /// The phase's source.
    pub source: &'a Source,
    /// The phase's destination configuration, when present.
    pub destination: Option<&'a Destination>,
    /// The opened writer for the destination, when present.
    pub writer: Option<&'a mut Writer>,
}

/// A phase's unit of work.
#[derive(Clone)]
pub enum Operation {
    /// Applies a per-document callback to a streamed source.
    Transform(TransformOperation),
    /// Delegates reshaping to the database's aggregation engine.
    Aggregation(AggregationOperation),
    /// Feeds source batches through a small sub-aggregation.
    StreamingAggregation(StreamingAggregationOperation),
    /// Creates an index on the source collection.
    CreateIndex(IndexOperation),
    /// Renames the source collection.
    RenameCollection(RenameCollectionOperation),
    /// Drops the source collection.
    DropCollection(DropCollectionOperation),
    /// Maps entries of an external file into the destination.
    Import(ImportOperation),
    /// Hands every source document to a user callback.
    Export(ExportOperation),
}

impl Operation {
    /// Builds a per-document transform operation.
    pub fn transform<F>(callback: F) -> Self
    where
        F: Fn(Document) -> anyhow::Result<Document> + Send + Sync + 'static,
    {
        Self::Transform(TransformOperation::new(Arc::new(callback)))
    }

    /// Builds an aggregation-passthrough operation.
    pub fn aggregation(pipeline: Vec<Value>) -> Self {
        Self::Aggregation(AggregationOperation::new(pipeline))
    }

    /// Builds a streaming sub-aggregation operation.
    pub fn streaming_aggregation(pipeline: Vec<Value>, batch_size: usize) -> Self {
        Self::StreamingAggregation(StreamingAggregationOperation::new(pipeline, batch_size))
    }

    /// Builds an index-creation operation.
    pub fn create_index(keys: Document) -> Self {
        Self::CreateIndex(IndexOperation::new(keys))
    }

    /// Builds a rename operation.
    pub fn rename_collection(new_name: impl Into<String>) -> Self {
        Self::RenameCollection(RenameCollectionOperation::new(new_name))
    }

    /// Builds a drop operation.
    pub fn drop_collection() -> Self {
        Self::DropCollection(DropCollectionOperation)
    }

    /// Builds a file-import operation.
    pub fn import<F>(callback: F) -> Self
    where
        F: Fn(Document) -> anyhow::Result<Document> + Send + Sync + 'static,
    {
        Self::Import(ImportOperation::new(Arc::new(callback)))
    }

    /// Builds an export operation.
    pub fn export<F>(callback: F) -> Self
    where
        F: Fn(Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Export(ExportOperation::new(Arc::new(callback)))
    }

    /// Whether this operation requires a configured source.
    pub fn needs_source(&self) -> bool {
        true
    }

    /// Whether this operation requires a configured destination.
    pub fn needs_destination(&self) -> bool {
        matches!(
            self,
            Self::Transform(_) | Self::Aggregation(_) | Self::Import(_)
        )
    }

    /// Whether this operation can read directly from the given destination
    /// type of an upstream phase, or needs a fresh default instead.
    pub fn accepts_dependency_output(&self, destination: &Destination) -> bool {
        match self {
            Self::Transform(_) => true,
            Self::Aggregation(_) | Self::StreamingAggregation(_) => destination.is_collection(),
            _ => false,
        }
    }

    /// Creates the fallback destination assigned to `upstream` when this
    /// operation is auto-wired to consume its output.
    pub fn create_default_destination(&self, upstream: &PhaseHandle) -> Result<Destination> {
        match self {
            Self::Transform(_) => Ok(Destination::Pipe(Arc::new(Pipe::new()))),
            // Aggregations read durable collections, so the hand-off goes
            // through a temporary collection dropped after the run.
            Self::Aggregation(_) | Self::StreamingAggregation(_) => {
                let collection = format!("mongration-tmp-{}", upstream.sanitized_name());
                let destination = CollectionDestination::new("mongrations", &collection);
                let dropped = collection.clone();
                upstream.finalize_with(
                    format!("drop temporary collection {collection}"),
                    move |store: Arc<dyn DocumentStore>| async move {
                        store.drop_collection("mongrations", &dropped).await
                    },
                );
                Ok(Destination::Collection(destination))
            }
            _ => Err(ConfigurationError::new(format!(
                "a {self} operation cannot consume the output of phase '{}'",
                upstream.name()
            ))
            .with_phases(vec![upstream.name()])
            .into()),
        }
    }

    /// Runs the operation to completion; returns the number of documents
    /// processed.
    pub async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<u64> {
        match self {
            Self::Transform(op) => op.invoke(ctx).await,
            Self::Aggregation(op) => op.invoke(ctx).await,
            Self::StreamingAggregation(op) => op.invoke(ctx).await,
            Self::CreateIndex(op) => op.invoke(ctx).await,
            Self::RenameCollection(op) => op.invoke(ctx).await,
            Self::DropCollection(op) => op.invoke(ctx).await,
            Self::Import(op) => op.invoke(ctx).await,
            Self::Export(op) => op.invoke(ctx).await,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transform(_) => "transform",
            Self::Aggregation(_) => "aggregation",
            Self::StreamingAggregation(_) => "streaming-aggregation",
            Self::CreateIndex(_) => "create-index",
            Self::RenameCollection(_) => "rename-collection",
            Self::DropCollection(_) => "drop-collection",
            Self::Import(_) => "import",
            Self::Export(_) => "export",
        };
        write!(f, "{name}")
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({self})")
    }
}

/// Extracts a collection source or reports the incompatibility.
pub(crate) fn require_collection_source<'a>(
    operation: &str,
    source: &'a Source,
) -> Result<&'a CollectionSource> {
    match source {
        Source::Collection(src) => Ok(src),
        other => Err(MongrationError::SourceIncompatibility {
            operation: operation.to_string(),
            source_kind: other.to_string(),
        }),
    }
}
