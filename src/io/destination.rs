//! Phase output destinations and their runtime writers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::document::Document;
use crate::errors::{ConfigurationError, Result};
use crate::phase::PhaseHandle;
use crate::store::DocumentStore;

use super::pipe::Pipe;
use super::source::{CollectionSource, Source};

/// Default number of documents buffered before a flush.
pub const DEFAULT_WRITE_BATCH: usize = 128;

/// Where a phase writes its documents.
///
/// A `Destination` is cheap-clone configuration; the stateful runtime side
/// is obtained from [`open`](Destination::open).
#[derive(Debug, Clone)]
pub enum Destination {
    /// A durable collection, written as bulk idempotent upserts.
    Collection(CollectionDestination),
    /// A JSON document-array file.
    File(FileDestination),
    /// A streaming hand-off into a dependent phase.
    Pipe(Arc<Pipe>),
}

/// A collection destination.
#[derive(Debug, Clone)]
pub struct CollectionDestination {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
    /// Flush threshold.
    pub batch_size: usize,
}

impl CollectionDestination {
    /// Creates a collection destination with the default batch size.
    #[must_use]
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            batch_size: DEFAULT_WRITE_BATCH,
        }
    }
}

/// A JSON document-array file destination.
#[derive(Debug, Clone)]
pub struct FileDestination {
    /// Path of the file to write.
    pub path: PathBuf,
    /// Flush threshold.
    pub batch_size: usize,
}

impl FileDestination {
    /// Creates a file destination with the default batch size.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_size: DEFAULT_WRITE_BATCH,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(dest) => write!(f, "{}/{}", dest.database, dest.collection),
            Self::File(dest) => write!(f, "file://{}", dest.path.display()),
            Self::Pipe(_) => write!(f, "pipe"),
        }
    }
}

impl Destination {
    /// Whether this destination is a durable collection.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::Collection(_))
    }

    /// Opens the runtime writer for this destination.
    pub async fn open(&self, store: &Arc<dyn DocumentStore>) -> Result<Writer> {
        match self {
            Self::Collection(dest) => Ok(Writer::Collection {
                store: Arc::clone(store),
                database: dest.database.clone(),
                collection: dest.collection.clone(),
                batch_size: dest.batch_size,
                buffer: Vec::new(),
            }),
            Self::File(dest) => {
                if let Some(parent) = dest.path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let mut file = fs::File::create(&dest.path).await?;
                file.write_all(b"[").await?;
                Ok(Writer::File {
                    file,
                    batch_size: dest.batch_size,
                    buffer: Vec::new(),
                    wrote_any: false,
                })
            }
            Self::Pipe(pipe) => Ok(Writer::Pipe(Arc::clone(pipe))),
        }
    }

    /// Wires this destination, already assigned to `upstream`, as the input
    /// of `downstream`.
    ///
    /// A pipe becomes the downstream source directly. A collection
    /// destination rewires the downstream source to that collection and
    /// registers a wait on the upstream's completion, since the collection
    /// is only safe to read once the upstream has finished and flushed.
    pub fn wire(&self, upstream: &PhaseHandle, downstream: &PhaseHandle) -> Result<()> {
        match self {
            Self::Pipe(pipe) => {
                downstream.set_source(Source::Phase(Arc::clone(pipe)));
                Ok(())
            }
            Self::Collection(dest) => {
                downstream.set_source(Source::Collection(CollectionSource::new(
                    &dest.database,
                    &dest.collection,
                )));
                downstream.wait_for_phase(upstream);
                Ok(())
            }
            Self::File(dest) => Err(ConfigurationError::new(format!(
                "file destination {} cannot feed phase '{}'",
                dest.path.display(),
                downstream.name()
            ))
            .with_phases(vec![upstream.name(), downstream.name()])
            .into()),
        }
    }
}

/// The stateful writer side of a [`Destination`].
pub enum Writer {
    /// Buffers documents and flushes them as bulk idempotent upserts.
    Collection {
        /// Store handle.
        store: Arc<dyn DocumentStore>,
        /// Database name.
        database: String,
        /// Collection name.
        collection: String,
        /// Flush threshold.
        batch_size: usize,
        /// Documents awaiting flush.
        buffer: Vec<Document>,
    },
    /// Writes a structurally valid JSON document array.
    File {
        /// Open file handle.
        file: fs::File,
        /// Flush threshold.
        batch_size: usize,
        /// Documents awaiting flush.
        buffer: Vec<Document>,
        /// Whether any document has been written (separator tracking).
        wrote_any: bool,
    },
    /// Forwards documents into the shared pipe.
    Pipe(Arc<Pipe>),
}

impl Writer {
    /// Forwards the producer's total-count estimate to a consumer waiting
    /// on the other end of a pipe. No-op for durable destinations.
    pub fn hint_total(&self, estimate: Option<u64>) {
        if let Self::Pipe(pipe) = self {
            pipe.hint_total(estimate);
        }
    }

    /// Buffers a document, flushing when the batch threshold is reached.
    pub async fn push(&mut self, doc: Document) -> Result<()> {
        let should_flush = match self {
            Self::Collection { batch_size, buffer, .. }
            | Self::File { batch_size, buffer, .. } => {
                buffer.push(doc);
                buffer.len() >= *batch_size
            }
            Self::Pipe(pipe) => return pipe.push(doc),
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Collection {
                store,
                database,
                collection,
                buffer,
                ..
            } => {
                if buffer.is_empty() {
                    return Ok(());
                }
                let batch = std::mem::take(buffer);
                store.bulk_upsert(database, collection, batch).await
            }
            Self::File {
                file,
                buffer,
                wrote_any,
                ..
            } => {
                let mut chunk = String::new();
                for doc in buffer.drain(..) {
                    if *wrote_any {
                        chunk.push(',');
                    }
                    chunk.push('\n');
                    chunk.push_str(&serde_json::to_string(&doc)?);
                    *wrote_any = true;
                }
                file.write_all(chunk.as_bytes()).await?;
                Ok(())
            }
            Self::Pipe(_) => Ok(()),
        }
    }

    /// Flushes the remainder and finalizes the destination. For a file this
    /// closes the document array; for a pipe it signals end-of-stream.
    pub async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        match self {
            Self::Collection { .. } => Ok(()),
            Self::File { file, .. } => {
                file.write_all(b"\n]").await?;
                file.flush().await?;
                Ok(())
            }
            Self::Pipe(pipe) => {
                // A producer that never estimated must still unblock a
                // consumer waiting on the hint. First write wins, so this
                // is a no-op when a real estimate was published.
                pipe.hint_total(None);
                pipe.close();
                Ok(())
            }
        }
    }

    /// Tears the writer down after a failure without flushing buffered
    /// documents. A pipe is hinted and closed so a consumer blocked on it
    /// unblocks instead of deadlocking the run.
    pub fn abort(&mut self) {
        match self {
            Self::Collection { buffer, .. } | Self::File { buffer, .. } => buffer.clear(),
            Self::Pipe(pipe) => {
                pipe.hint_total(None);
                pipe.close();
            }
        }
    }
}
