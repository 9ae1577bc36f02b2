//! The execution engine: runs a migration's phases concurrently in
//! dependency order.
//!
//! Every phase gets its own task. Phases connected by a pipe overlap
//! fully; phases separated by a durable collection wait on the upstream's
//! completion signal. A failed phase tears down its hand-offs so
//! dependents fail fast instead of hanging, and all registered finalizers
//! run before the engine returns, success or not.

mod progress;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::errors::{ConfigurationError, MongrationError, Result};
use crate::graph::{DependencyGraph, VertexId};
use crate::io::Destination;
use crate::migration::Migration;
use crate::ops::InvokeContext;
use crate::phase::PhaseHandle;
use crate::store::DocumentStore;

pub use progress::{
    CollectingProgress, CollectingProgressFactory, NoOpProgress, ProgressFactory, ProgressSink,
    TracingProgress, TracingProgressFactory,
};

/// Outcome of a single phase.
#[derive(Debug)]
pub struct PhaseReport {
    /// Phase name.
    pub phase: String,
    /// Documents processed.
    pub documents: u64,
    /// Wall-clock duration of the phase body.
    pub duration: Duration,
}

/// Outcome of a whole migration run.
#[derive(Debug)]
pub struct RunReport {
    /// Migration name.
    pub migration: String,
    /// Per-phase outcomes, in completion order.
    pub phases: Vec<PhaseReport>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

/// Runs migrations.
pub struct Engine {
    progress: Arc<dyn ProgressFactory>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Arc::new(TracingProgressFactory))
    }
}

impl Engine {
    /// Creates an engine with the given progress factory.
    #[must_use]
    pub fn new(progress: Arc<dyn ProgressFactory>) -> Self {
        Self { progress }
    }

    /// Runs one migration to completion.
    ///
    /// Validates the configuration, derives a dependency-respecting start
    /// order, spawns one task per phase and drains them all. The first
    /// phase error is propagated after every task has settled and every
    /// finalizer has run.
    ///
    /// # Errors
    ///
    /// Configuration problems (unrunnable phases, cyclic or dangling
    /// dependencies) surface before any phase starts; phase failures are
    /// wrapped with the failing phase's name.
    pub async fn run(
        &self,
        store: &Arc<dyn DocumentStore>,
        migration: &Migration,
    ) -> Result<RunReport> {
        let (graph, order) = plan(migration)?;

        info!(migration = %migration.name(), phases = order.len(), "starting migration");
        let start = Instant::now();

        let mut tasks = FuturesUnordered::new();
        for id in &order {
            let Some(phase) = graph.vertex(*id) else {
                return Err(MongrationError::Internal(
                    "traversed vertex disappeared from the graph".into(),
                ));
            };
            let phase = phase.clone();
            let sink = self.progress.for_phase(&phase.name());
            let store = Arc::clone(store);
            tasks.push(tokio::spawn(run_phase(store, phase, sink)));
        }

        let mut failure: Option<MongrationError> = None;
        let mut phases = Vec::new();
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(Ok(report)) => phases.push(report),
                Ok(Err(err)) => {
                    warn!(error = %err, "phase failed");
                    failure.get_or_insert(err);
                }
                Err(join_err) => {
                    failure.get_or_insert(MongrationError::Internal(format!(
                        "phase task panicked: {join_err}"
                    )));
                }
            }
        }

        // Finalizers run even after a failure; temp hand-off collections
        // must not outlive the attempt.
        for phase in migration.phases() {
            for (name, finalizer) in phase.take_finalizers() {
                debug!(finalizer = %name, "running finalizer");
                if let Err(err) = finalizer(Arc::clone(store)).await {
                    warn!(finalizer = %name, error = %err, "finalizer failed");
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }
        let duration = start.elapsed();
        info!(
            migration = %migration.name(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "migration completed"
        );
        Ok(RunReport {
            migration: migration.name().to_string(),
            phases,
            duration,
        })
    }
}

/// Pre-flight check: validates the migration and derives its
/// dependency-respecting start order, without executing anything.
pub(crate) fn plan(
    migration: &Migration,
) -> Result<(DependencyGraph<PhaseHandle>, Vec<VertexId>)> {
    migration.validate()?;
    let graph = migration.build_graph()?;

    let mut order = Vec::new();
    graph.traverse(
        |id| order.push(id),
        |from, to| debug!(from, to, "dependency satisfied"),
    );
    if order.len() != graph.len() {
        let visited: HashSet<_> = order.iter().copied().collect();
        let stuck: Vec<String> = graph
            .indices()
            .into_iter()
            .filter(|id| !visited.contains(id))
            .filter_map(|id| graph.vertex(id).map(PhaseHandle::name))
            .collect();
        let message = format!(
            "phases can never become ready (cyclic or dangling dependencies): {}",
            stuck.join(", ")
        );
        return Err(ConfigurationError::new(message).with_phases(stuck).into());
    }
    Ok((graph, order))
}

async fn run_phase(
    store: Arc<dyn DocumentStore>,
    phase: PhaseHandle,
    progress: Arc<dyn ProgressSink>,
) -> Result<PhaseReport> {
    let name = phase.name();
    match execute_phase(&store, &phase, progress.as_ref()).await {
        Ok(report) => Ok(report),
        Err(err) => {
            // Unblock anything reading or waiting on this phase so the
            // failure propagates instead of deadlocking the run.
            if let Some(Destination::Pipe(pipe)) = phase.destination() {
                pipe.hint_total(None);
                pipe.close();
            }
            phase.abandon();
            Err(MongrationError::Operation {
                phase: name,
                source: Box::new(err),
            })
        }
    }
}

async fn execute_phase(
    store: &Arc<dyn DocumentStore>,
    phase: &PhaseHandle,
    progress: &dyn ProgressSink,
) -> Result<PhaseReport> {
    let name = phase.name();
    let operation = phase.operation().ok_or_else(|| {
        ConfigurationError::new(format!("phase '{name}' has no operation"))
            .with_phases(vec![name.clone()])
    })?;
    let source = phase.source().ok_or_else(|| {
        ConfigurationError::new(format!("phase '{name}' has no source"))
            .with_phases(vec![name.clone()])
    })?;
    let destination = phase.destination();

    let described = destination
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string);
    progress.message(&format!(
        "op: {operation}, src: {source}, dst: {described}: waiting"
    ));
    for waiter in phase.take_waiters() {
        waiter.await.map_err(|_| {
            MongrationError::Internal(format!(
                "a dependency of phase '{name}' failed before completing"
            ))
        })?;
    }

    progress.message("running");
    let start = Instant::now();
    let mut writer = match &destination {
        Some(dest) => Some(dest.open(store).await?),
        None => None,
    };
    let invoked = operation
        .invoke(InvokeContext {
            store,
            progress,
            source: &source,
            destination: destination.as_ref(),
            writer: writer.as_mut(),
        })
        .await;
    let documents = match invoked {
        Ok(documents) => documents,
        Err(err) => {
            if let Some(writer) = writer.as_mut() {
                writer.abort();
            }
            return Err(err);
        }
    };
    if let Some(writer) = writer.as_mut() {
        writer.close().await?;
    }
    phase.notify_completion(documents);

    let duration = start.elapsed();
    info!(
        phase = %name,
        documents,
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "phase completed"
    );
    Ok(PhaseReport {
        phase: name,
        documents,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn memory_store() -> (Arc<MemoryStore>, Arc<dyn DocumentStore>) {
        let mem = Arc::new(MemoryStore::new());
        let store: Arc<dyn DocumentStore> = Arc::clone(&mem) as Arc<dyn DocumentStore>;
        (mem, store)
    }

    #[tokio::test]
    async fn two_phase_chain_streams_through_a_pipe() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![
                doc(json!({"_id": 1, "x": 2})),
                doc(json!({"_id": 2, "x": 5})),
            ],
        );

        let mut migration = Migration::new("0001-double");
        let first = migration.phase("double x");
        first.from_collection("app", "src");
        first
            .transform(|mut d| {
                let x = d.get("x").and_then(serde_json::Value::as_i64).unwrap_or(0);
                d.insert("x".into(), json!(x * 2));
                Ok(d)
            })
            .unwrap();

        let second = migration.phase("persist");
        second.from_phase(&first).unwrap();
        second.into_collection("app", "dst");
        second.transform(|d| Ok(d)).unwrap();

        let report = Engine::default().run(&store, &migration).await.unwrap();
        assert_eq!(report.phases.len(), 2);

        let out = mem.documents("app", "dst");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("x"), Some(&json!(4)));
        assert_eq!(out[1].get("x"), Some(&json!(10)));
        // The intermediate hand-off never touched a durable collection:
        // only the seeded source and the final destination exist.
        assert_eq!(
            mem.collection_names(),
            vec![
                ("app".to_string(), "dst".to_string()),
                ("app".to_string(), "src".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn aggregation_consumer_waits_for_temp_collection() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![
                doc(json!({"_id": 1, "kind": "a"})),
                doc(json!({"_id": 2, "kind": "b"})),
            ],
        );

        let mut migration = Migration::new("0002-filter");
        let first = migration.phase("copy");
        first.from_collection("app", "src");
        first.transform(|d| Ok(d)).unwrap();

        let second = migration.phase("keep kind a");
        second.from_phase(&first).unwrap();
        second.into_collection("app", "dst");
        second.aggregate(vec![json!({"$match": {"kind": "a"}})]).unwrap();

        Engine::default().run(&store, &migration).await.unwrap();

        let out = mem.documents("app", "dst");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("kind"), Some(&json!("a")));
        // The appended $out stage wrote server-side.
        let recorded = mem.recorded_pipelines();
        let pipeline = recorded.last().unwrap();
        assert_eq!(
            pipeline.last().and_then(|stage| stage.get("$out")),
            Some(&json!({"db": "app", "coll": "dst"}))
        );
        // The temp hand-off collection was dropped by the finalizer.
        assert!(!mem.has_collection("mongrations", "mongration-tmp-copy"));
    }

    #[tokio::test]
    async fn aggregation_producer_streams_into_piped_consumer() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![
                doc(json!({"_id": 1, "kind": "a"})),
                doc(json!({"_id": 2, "kind": "b"})),
            ],
        );

        let mut migration = Migration::new("0006-aggregate-then-pipe");
        let first = migration.phase("keep kind a");
        first.from_collection("app", "src");
        first.aggregate(vec![json!({"$match": {"kind": "a"}})]).unwrap();

        let second = migration.phase("persist");
        second.from_phase(&first).unwrap();
        second.into_collection("app", "dst");
        second.transform(|d| Ok(d)).unwrap();

        // The aggregation has no count estimate; the piped consumer must
        // still start instead of waiting forever for one.
        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            Engine::default().run(&store, &migration),
        )
        .await
        .expect("run should not hang on a pipe hint")
        .unwrap();
        assert_eq!(report.phases.len(), 2);

        let out = mem.documents("app", "dst");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("kind"), Some(&json!("a")));
    }

    #[tokio::test]
    async fn cyclic_dependencies_fail_before_any_phase_runs() {
        let (mem, store) = memory_store();
        mem.insert_many("app", "src", vec![doc(json!({"_id": 1}))]);

        let mut migration = Migration::new("0003-cycle");
        let a = migration.phase("a");
        let b = migration.phase("b");
        a.from_collection("app", "src").into_collection("app", "mid");
        a.transform(|d| Ok(d)).unwrap();
        b.from_collection("app", "mid").into_collection("app", "dst");
        b.transform(|d| Ok(d)).unwrap();
        a.wait_for_phase(&b);
        b.wait_for_phase(&a);

        let err = Engine::default().run(&store, &migration).await.unwrap_err();
        assert!(matches!(err, MongrationError::Configuration(_)));
        assert!(!mem.has_collection("app", "dst"));
    }

    #[tokio::test]
    async fn producer_failure_fails_the_piped_consumer_without_hanging() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))],
        );

        let mut migration = Migration::new("0004-fail");
        let first = migration.phase("explode");
        first.from_collection("app", "src");
        first
            .transform(|_| Err(anyhow::anyhow!("document beyond repair")))
            .unwrap();

        let second = migration.phase("persist");
        second.from_phase(&first).unwrap();
        second.into_collection("app", "dst");
        second.transform(|d| Ok(d)).unwrap();

        let err = Engine::default().run(&store, &migration).await.unwrap_err();
        assert!(err.to_string().contains("explode") || err.to_string().contains("beyond repair"));
        assert!(mem.documents("app", "dst").is_empty());
    }

    #[tokio::test]
    async fn progress_receives_totals_and_counts() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))],
        );

        let factory = Arc::new(CollectingProgressFactory::default());
        let engine = Engine::new(Arc::clone(&factory) as Arc<dyn ProgressFactory>);

        let mut migration = Migration::new("0005-progress");
        let phase = migration.phase("copy");
        phase.from_collection("app", "src");
        phase.into_collection("app", "dst");
        phase.transform(|d| Ok(d)).unwrap();

        engine.run(&store, &migration).await.unwrap();

        let sink = factory.sink("copy").unwrap();
        assert_eq!(sink.processed(), 2);
        assert_eq!(sink.totals(), vec![Some(2)]);
        assert!(!sink.messages().is_empty());
    }
}
