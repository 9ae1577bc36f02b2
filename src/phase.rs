//! Phases: named units of work chained into a dependency graph.
//!
//! A phase is configured through [`PhaseHandle`], a shared, cloneable view
//! over the phase state. Sharing matters because wiring is bidirectional:
//! declaring `b.from_phase(&a)` may assign a destination to `a` on `b`'s
//! behalf, so both sides of the edge need mutable access to each other at
//! configuration time.
//!
//! Wiring is deferred when the dependency is declared before the operation:
//! the upstream handle is parked until an operation arrives, at which point
//! a single pending dependency is resolved automatically. More than one
//! pending dependency is ambiguous and is left for explicit wiring.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::document::Document;
use crate::errors::{ConfigurationError, Result};
use crate::io::{
    AggregationSource, CollectionDestination, CollectionSource, Destination, FileDestination,
    FileSource, Source,
};
use crate::ops::{Operation, DEFAULT_STREAM_BATCH};
use crate::store::DocumentStore;

/// Callback invoked once with the phase's processed-document count.
pub type CompletionCallback = Box<dyn FnOnce(u64) + Send>;

/// Named async cleanup run after the whole migration attempt, success or
/// not.
pub type Finalizer = Box<dyn FnOnce(Arc<dyn DocumentStore>) -> BoxFuture<'static, Result<()>> + Send>;

struct Phase {
    name: String,
    source: Option<Source>,
    destination: Option<Destination>,
    operation: Option<Operation>,
    dependencies: Vec<PhaseHandle>,
    pending_wiring: Vec<PhaseHandle>,
    finalizers: Vec<(String, Finalizer)>,
    completion_callbacks: Vec<CompletionCallback>,
    must_wait: Vec<oneshot::Receiver<()>>,
    completed: bool,
}

/// Shared, cloneable handle to a phase.
///
/// All configuration methods return `&Self` (or `Result<&Self>`) so calls
/// chain:
///
/// ```
/// use mongrations::prelude::*;
///
/// # fn demo() -> mongrations::errors::Result<()> {
/// let mut migration = Migration::new("0001-normalize-emails");
/// migration
///     .phase("lowercase emails")
///     .from_collection("app", "users")
///     .into_collection("app", "users_v2")
///     .transform(|mut doc| {
///         let lowered = doc
///             .get("email")
///             .and_then(|v| v.as_str())
///             .map(str::to_lowercase);
///         if let Some(email) = lowered {
///             doc.insert("email".into(), email.into());
///         }
///         Ok(doc)
///     })?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PhaseHandle {
    inner: Arc<Mutex<Phase>>,
}

impl PhaseHandle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Phase {
                name: name.into(),
                source: None,
                destination: None,
                operation: None,
                dependencies: Vec::new(),
                pending_wiring: Vec::new(),
                finalizers: Vec::new(),
                completion_callbacks: Vec::new(),
                must_wait: Vec::new(),
                completed: false,
            })),
        }
    }

    /// The phase's display name.
    #[must_use]
    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    /// The phase name reduced to characters safe in a collection name.
    #[must_use]
    pub fn sanitized_name(&self) -> String {
        self.name()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    }

    /// Whether two handles refer to the same phase.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- source configuration ------------------------------------------

    /// Reads the whole collection.
    pub fn from_collection(
        &self,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> &Self {
        self.set_source(Source::Collection(CollectionSource::new(
            database, collection,
        )));
        self
    }

    /// Reads the collection filtered by an equality document.
    pub fn from_collection_filtered(
        &self,
        database: impl Into<String>,
        collection: impl Into<String>,
        filter: Document,
    ) -> &Self {
        let mut source = CollectionSource::new(database, collection);
        source.filter = Some(filter);
        self.set_source(Source::Collection(source));
        self
    }

    /// Reads the result of a database-side aggregation.
    pub fn from_aggregation(
        &self,
        database: impl Into<String>,
        collection: impl Into<String>,
        pipeline: Vec<Value>,
    ) -> &Self {
        self.set_source(Source::Aggregation(AggregationSource {
            database: database.into(),
            collection: collection.into(),
            pipeline,
        }));
        self
    }

    /// Reads the output of another phase.
    ///
    /// When this phase already has an operation the edge is wired
    /// immediately; otherwise wiring is deferred until an operation is
    /// attached.
    ///
    /// # Errors
    ///
    /// A phase cannot depend on itself.
    pub fn from_phase(&self, upstream: &PhaseHandle) -> Result<&Self> {
        if self.ptr_eq(upstream) {
            return Err(ConfigurationError::new(format!(
                "phase '{}' cannot read from itself",
                self.name()
            ))
            .with_phases(vec![self.name()])
            .into());
        }
        let has_operation = {
            let mut inner = self.inner.lock();
            inner.dependencies.push(upstream.clone());
            inner.operation.is_some()
        };
        if has_operation {
            self.configure_dependency(upstream)?;
        } else {
            self.inner.lock().pending_wiring.push(upstream.clone());
        }
        Ok(self)
    }

    // ---- operation configuration ---------------------------------------

    /// Attaches a per-document transform.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn transform<F>(&self, callback: F) -> Result<&Self>
    where
        F: Fn(Document) -> anyhow::Result<Document> + Send + Sync + 'static,
    {
        self.attach_operation(Operation::transform(callback))
    }

    /// Attaches an aggregation-passthrough operation.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn aggregate(&self, pipeline: Vec<Value>) -> Result<&Self> {
        self.attach_operation(Operation::aggregation(pipeline))
    }

    /// Attaches a streaming sub-aggregation with the default batch size.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn stream(&self, pipeline: Vec<Value>) -> Result<&Self> {
        self.stream_with_batch(pipeline, DEFAULT_STREAM_BATCH)
    }

    /// Attaches a streaming sub-aggregation with an explicit batch size.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn stream_with_batch(&self, pipeline: Vec<Value>, batch_size: usize) -> Result<&Self> {
        self.attach_operation(Operation::streaming_aggregation(pipeline, batch_size))
    }

    /// Reads a JSON document-array file and maps each entry into the
    /// destination.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn import_from<F>(&self, path: impl Into<std::path::PathBuf>, callback: F) -> Result<&Self>
    where
        F: Fn(Document) -> anyhow::Result<Document> + Send + Sync + 'static,
    {
        self.set_source(Source::File(FileSource { path: path.into() }));
        self.attach_operation(Operation::import(callback))
    }

    /// Hands every source document to a callback.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn export_with<F>(&self, callback: F) -> Result<&Self>
    where
        F: Fn(Document) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.attach_operation(Operation::export(callback))
    }

    /// Creates an index on the already-configured source collection.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn create_index(&self, keys: Document) -> Result<&Self> {
        self.attach_operation(Operation::create_index(keys))
    }

    /// Creates an index on an explicit collection.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn create_index_on(
        &self,
        database: impl Into<String>,
        collection: impl Into<String>,
        keys: Document,
    ) -> Result<&Self> {
        self.from_collection(database, collection);
        self.attach_operation(Operation::create_index(keys))
    }

    /// Renames the source collection.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn rename_collection(&self, new_name: impl Into<String>) -> Result<&Self> {
        self.attach_operation(Operation::rename_collection(new_name))
    }

    /// Drops the source collection.
    ///
    /// # Errors
    ///
    /// Fails when a deferred dependency cannot be wired.
    pub fn drop_collection(&self) -> Result<&Self> {
        self.attach_operation(Operation::drop_collection())
    }

    // ---- destination configuration -------------------------------------

    /// Writes into a durable collection.
    pub fn into_collection(
        &self,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> &Self {
        self.set_destination(Destination::Collection(CollectionDestination::new(
            database, collection,
        )));
        self
    }

    /// Writes a JSON document-array file.
    pub fn into_file(&self, path: impl Into<std::path::PathBuf>) -> &Self {
        self.set_destination(Destination::File(FileDestination::new(path)));
        self
    }

    // ---- ordering and lifecycle ----------------------------------------

    /// Orders this phase strictly after `upstream` without consuming its
    /// output.
    pub fn wait_for_phase(&self, upstream: &PhaseHandle) -> &Self {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.must_wait.push(rx);
            inner.dependencies.push(upstream.clone());
        }
        upstream.on_completed(move |_documents| {
            let _ = tx.send(());
        });
        self
    }

    /// Registers a callback run once this phase completes successfully,
    /// with the processed-document count.
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.inner
            .lock()
            .completion_callbacks
            .push(Box::new(callback));
    }

    /// Registers a named async cleanup run after the whole migration
    /// attempt, whether it succeeded or not.
    pub fn finalize_with<F, Fut>(&self, name: impl Into<String>, finalizer: F)
    where
        F: FnOnce(Arc<dyn DocumentStore>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: Finalizer = Box::new(move |store| finalizer(store).boxed());
        self.inner.lock().finalizers.push((name.into(), boxed));
    }

    /// Fires completion callbacks with the processed-document count. Only
    /// the first call has an effect.
    pub fn notify_completion(&self, documents: u64) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            inner.completed = true;
            std::mem::take(&mut inner.completion_callbacks)
        };
        for callback in callbacks {
            callback(documents);
        }
    }

    /// Drops completion callbacks without firing them. Dependents blocked
    /// on this phase observe the dropped signal and fail instead of
    /// hanging.
    pub fn abandon(&self) {
        let dropped = std::mem::take(&mut self.inner.lock().completion_callbacks);
        drop(dropped);
    }

    pub(crate) fn take_waiters(&self) -> Vec<oneshot::Receiver<()>> {
        std::mem::take(&mut self.inner.lock().must_wait)
    }

    pub(crate) fn take_finalizers(&self) -> Vec<(String, Finalizer)> {
        std::mem::take(&mut self.inner.lock().finalizers)
    }

    // ---- accessors ------------------------------------------------------

    /// The configured source, when present.
    #[must_use]
    pub fn source(&self) -> Option<Source> {
        self.inner.lock().source.clone()
    }

    /// The configured destination, when present.
    #[must_use]
    pub fn destination(&self) -> Option<Destination> {
        self.inner.lock().destination.clone()
    }

    /// The attached operation, when present.
    #[must_use]
    pub fn operation(&self) -> Option<Operation> {
        self.inner.lock().operation.clone()
    }

    /// Snapshot of the declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> Vec<PhaseHandle> {
        self.inner.lock().dependencies.clone()
    }

    /// Replaces the source.
    pub fn set_source(&self, source: Source) {
        self.inner.lock().source = Some(source);
    }

    /// Replaces the destination.
    pub fn set_destination(&self, destination: Destination) {
        self.inner.lock().destination = Some(destination);
    }

    // ---- wiring ---------------------------------------------------------

    fn attach_operation(&self, operation: Operation) -> Result<&Self> {
        self.inner.lock().operation = Some(operation);
        self.resolve_pending_wiring()?;
        Ok(self)
    }

    /// Wires deferred dependencies now that an operation is known. Exactly
    /// one pending dependency is unambiguous; more are parked until wired
    /// explicitly.
    fn resolve_pending_wiring(&self) -> Result<()> {
        let pending = std::mem::take(&mut self.inner.lock().pending_wiring);
        match pending.as_slice() {
            [] => Ok(()),
            [upstream] => self.configure_dependency(upstream),
            _ => {
                warn!(
                    phase = %self.name(),
                    pending = pending.len(),
                    "cannot auto-wire a phase with multiple pending dependencies"
                );
                self.inner.lock().pending_wiring = pending;
                Ok(())
            }
        }
    }

    /// Connects this phase to `upstream`'s output. Reuses the upstream
    /// destination when the operation can consume it; otherwise assigns the
    /// operation's default hand-off destination to the upstream phase.
    fn configure_dependency(&self, upstream: &PhaseHandle) -> Result<()> {
        let operation = self.operation().ok_or_else(|| {
            ConfigurationError::new(format!(
                "phase '{}' has no operation; cannot wire dependency on '{}'",
                self.name(),
                upstream.name()
            ))
            .with_phases(vec![self.name(), upstream.name()])
        })?;
        let destination = match upstream.destination() {
            Some(existing) if operation.accepts_dependency_output(&existing) => existing,
            _ => operation.create_default_destination(upstream)?,
        };
        upstream.set_destination(destination.clone());
        destination.wire(upstream, self)
    }
}

impl std::fmt::Debug for PhaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Phase")
            .field("name", &inner.name)
            .field("source", &inner.source)
            .field("destination", &inner.destination)
            .field("operation", &inner.operation)
            .field("dependencies", &inner.dependencies.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transform_noop(handle: &PhaseHandle) {
        handle.transform(|d| Ok(d)).unwrap();
    }

    #[test]
    fn sanitized_name_is_collection_safe() {
        let phase = PhaseHandle::new("Split User & Org records");
        assert_eq!(phase.sanitized_name(), "split-user---org-records");
    }

    #[test]
    fn self_dependency_is_rejected() {
        let phase = PhaseHandle::new("a");
        assert!(phase.from_phase(&phase).is_err());
    }

    #[test]
    fn transform_chain_gets_a_pipe() {
        let producer = PhaseHandle::new("producer");
        producer.from_collection("app", "src");
        transform_noop(&producer);

        let consumer = PhaseHandle::new("consumer");
        consumer.from_phase(&producer).unwrap();
        transform_noop(&consumer);

        assert!(matches!(
            producer.destination(),
            Some(Destination::Pipe(_))
        ));
        assert!(matches!(consumer.source(), Some(Source::Phase(_))));
    }

    #[test]
    fn wiring_defers_until_operation_is_attached() {
        let producer = PhaseHandle::new("producer");
        producer.from_collection("app", "src");
        transform_noop(&producer);

        // Dependency declared before the operation: nothing is wired yet.
        let consumer = PhaseHandle::new("consumer");
        consumer.from_phase(&producer).unwrap();
        assert!(producer.destination().is_none());

        transform_noop(&consumer);
        assert!(producer.destination().is_some());
    }

    #[test]
    fn aggregation_consumer_forces_a_collection_hand_off() {
        let producer = PhaseHandle::new("build temp");
        producer.from_collection("app", "src");
        transform_noop(&producer);

        let consumer = PhaseHandle::new("summarize");
        consumer.from_phase(&producer).unwrap();
        consumer.aggregate(vec![json!({"$match": {}})]).unwrap();

        match producer.destination() {
            Some(Destination::Collection(dest)) => {
                assert_eq!(dest.database, "mongrations");
                assert!(dest.collection.starts_with("mongration-tmp-"));
            }
            other => panic!("expected collection destination, got {other:?}"),
        }
        // Reading a durable collection requires the producer to finish first.
        assert_eq!(consumer.take_waiters().len(), 1);
        // The temp collection is cleaned up afterwards.
        assert_eq!(producer.take_finalizers().len(), 1);
    }

    #[test]
    fn existing_collection_destination_is_reused() {
        let producer = PhaseHandle::new("producer");
        producer.from_collection("app", "src");
        producer.into_collection("app", "mid");
        transform_noop(&producer);

        let consumer = PhaseHandle::new("consumer");
        consumer.from_phase(&producer).unwrap();
        consumer.aggregate(vec![]).unwrap();

        match consumer.source() {
            Some(Source::Collection(src)) => {
                assert_eq!(src.database, "app");
                assert_eq!(src.collection, "mid");
            }
            other => panic!("expected collection source, got {other:?}"),
        }
    }

    #[test]
    fn multiple_pending_dependencies_are_not_auto_wired() {
        let a = PhaseHandle::new("a");
        let b = PhaseHandle::new("b");
        let consumer = PhaseHandle::new("consumer");
        consumer.from_phase(&a).unwrap();
        consumer.from_phase(&b).unwrap();
        transform_noop(&consumer);

        assert!(a.destination().is_none());
        assert!(b.destination().is_none());
        assert!(consumer.source().is_none());
    }

    #[test]
    fn notify_completion_fires_callbacks_once() {
        let phase = PhaseHandle::new("a");
        let count = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen = Arc::clone(&count);
        phase.on_completed(move |documents| {
            seen.fetch_add(documents, std::sync::atomic::Ordering::SeqCst);
        });
        phase.notify_completion(7);
        phase.notify_completion(7);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn abandon_unblocks_waiting_dependents() {
        let producer = PhaseHandle::new("producer");
        let consumer = PhaseHandle::new("consumer");
        consumer.wait_for_phase(&producer);

        producer.abandon();
        let waiters = consumer.take_waiters();
        assert_eq!(waiters.len(), 1);
        for waiter in waiters {
            assert!(waiter.await.is_err());
        }
    }
}
