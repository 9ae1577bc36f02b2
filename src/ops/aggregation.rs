//! Aggregation-based operations.

use futures::TryStreamExt;
use serde_json::{json, Value};

use crate::document::Document;
use crate::errors::Result;
use crate::io::{CollectionSource, Destination};

use super::{require_collection_source, InvokeContext};

/// Hands a pipeline to the database and lets it reshape the collection
/// server-side.
///
/// When the destination is a collection and the pipeline does not already
/// end in `$out`, one is appended so the database writes the result
/// directly, without round-tripping documents through this process. For
/// any other destination the result set is streamed back and forwarded
/// document by document.
#[derive(Clone)]
pub struct AggregationOperation {
    pipeline: Vec<Value>,
}

impl AggregationOperation {
    pub(crate) fn new(pipeline: Vec<Value>) -> Self {
        Self { pipeline }
    }

    pub(crate) async fn invoke(&self, mut ctx: InvokeContext<'_>) -> Result<u64> {
        let src = require_collection_source("aggregation", ctx.source)?;

        let mut pipeline = self.pipeline.clone();
        let mut server_side = false;
        if let Some(Destination::Collection(dest)) = ctx.destination {
            let ends_in_out = pipeline
                .last()
                .and_then(|stage| stage.get("$out"))
                .is_some();
            if !ends_in_out {
                pipeline.push(json!({
                    "$out": {"db": dest.database.clone(), "coll": dest.collection.clone()}
                }));
            }
            server_side = true;
        }
        // The result size of a pipeline is unknown up front; a piped
        // consumer still needs the hint before it can start reading.
        if let Some(writer) = ctx.writer.as_deref_mut() {
            writer.hint_total(None);
        }

        let mut cursor = ctx
            .store
            .aggregate(&src.database, &src.collection, &pipeline)
            .await?;
        let mut processed = 0u64;
        while let Some(doc) = cursor.try_next().await? {
            if !server_side {
                if let Some(writer) = ctx.writer.as_deref_mut() {
                    writer.push(doc).await?;
                }
            }
            processed += 1;
            ctx.progress.inc(1);
        }
        Ok(processed)
    }
}

/// Runs the pipeline over bounded batches of source documents instead of
/// the whole collection at once.
///
/// Each batch becomes a `$documents` stage prefixed to the configured
/// pipeline, so the database only ever sees a bounded working set; results
/// are streamed to the destination as they come back. The final partial
/// batch is flushed like any other.
#[derive(Clone)]
pub struct StreamingAggregationOperation {
    pipeline: Vec<Value>,
    batch_size: usize,
}

impl StreamingAggregationOperation {
    pub(crate) fn new(pipeline: Vec<Value>, batch_size: usize) -> Self {
        Self {
            pipeline,
            batch_size: batch_size.max(1),
        }
    }

    pub(crate) async fn invoke(&self, mut ctx: InvokeContext<'_>) -> Result<u64> {
        let src = require_collection_source("streaming-aggregation", ctx.source)?.clone();
        let (mut cursor, estimate) = ctx.source.cursor(ctx.store).await?;
        ctx.progress.set_total(estimate);
        if let Some(writer) = ctx.writer.as_deref_mut() {
            writer.hint_total(estimate);
        }

        let mut batch: Vec<Document> = Vec::with_capacity(self.batch_size);
        let mut processed = 0u64;
        while let Some(doc) = cursor.try_next().await? {
            batch.push(doc);
            processed += 1;
            if batch.len() >= self.batch_size {
                self.flush_batch(&mut ctx, &src, std::mem::take(&mut batch))
                    .await?;
            }
        }
        if !batch.is_empty() {
            self.flush_batch(&mut ctx, &src, batch).await?;
        }
        Ok(processed)
    }

    async fn flush_batch(
        &self,
        ctx: &mut InvokeContext<'_>,
        src: &CollectionSource,
        batch: Vec<Document>,
    ) -> Result<()> {
        let consumed = batch.len() as u64;
        let documents = Value::Array(batch.into_iter().map(Value::Object).collect());
        let mut pipeline = Vec::with_capacity(self.pipeline.len() + 1);
        pipeline.push(json!({"$documents": documents}));
        pipeline.extend(self.pipeline.iter().cloned());

        let mut cursor = ctx
            .store
            .aggregate(&src.database, &src.collection, &pipeline)
            .await?;
        while let Some(doc) = cursor.try_next().await? {
            if let Some(writer) = ctx.writer.as_deref_mut() {
                writer.push(doc).await?;
            }
        }
        ctx.progress.inc(consumed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::document::Document;
    use crate::engine::CollectingProgress;
    use crate::errors::MongrationError;
    use crate::io::{
        CollectionDestination, CollectionSource, Destination, FileDestination, Source,
    };
    use crate::ops::{InvokeContext, Operation};
    use crate::store::{DocumentStore, MemoryStore};

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
    async fn collection_destination_gets_an_appended_out_stage() {
        let (mem, store) = memory_store();
        mem.insert_many("app", "src", vec![doc(json!({"_id": 1, "kind": "a"}))]);

        let operation = Operation::aggregation(vec![json!({"$match": {"kind": "a"}})]);
        let source = Source::Collection(CollectionSource::new("app", "src"));
        let destination = Destination::Collection(CollectionDestination::new("app", "dst"));
        let progress = CollectingProgress::default();

        operation
            .invoke(InvokeContext {
                store: &store,
                progress: &progress,
                source: &source,
                destination: Some(&destination),
                writer: None,
            })
            .await
            .unwrap();

        let recorded = mem.recorded_pipelines();
        assert_eq!(
            recorded[0].last(),
            Some(&json!({"$out": {"db": "app", "coll": "dst"}}))
        );
        assert_eq!(mem.documents("app", "dst").len(), 1);
    }

    #[tokio::test]
    async fn existing_out_stage_is_left_alone() {
        let (mem, store) = memory_store();
        mem.insert_many("app", "src", vec![doc(json!({"_id": 1}))]);

        let operation = Operation::aggregation(vec![json!({"$out": "elsewhere"})]);
        let source = Source::Collection(CollectionSource::new("app", "src"));
        let destination = Destination::Collection(CollectionDestination::new("app", "dst"));
        let progress = CollectingProgress::default();

        operation
            .invoke(InvokeContext {
                store: &store,
                progress: &progress,
                source: &source,
                destination: Some(&destination),
                writer: None,
            })
            .await
            .unwrap();

        let recorded = mem.recorded_pipelines();
        assert_eq!(recorded[0].len(), 1);
        assert_eq!(mem.documents("app", "elsewhere").len(), 1);
    }

    #[tokio::test]
    async fn non_collection_destination_streams_results_back() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))],
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let operation = Operation::aggregation(vec![]);
        let source = Source::Collection(CollectionSource::new("app", "src"));
        let destination = Destination::File(FileDestination::new(path.clone()));
        let mut writer = destination.open(&store).await.unwrap();
        let progress = CollectingProgress::default();

        let processed = operation
            .invoke(InvokeContext {
                store: &store,
                progress: &progress,
                source: &source,
                destination: Some(&destination),
                writer: Some(&mut writer),
            })
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(processed, 2);
        let parsed: Vec<Document> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn aggregation_rejects_pipe_source() {
        let (_, store) = memory_store();
        let operation = Operation::aggregation(vec![]);
        let source = Source::Phase(Arc::new(crate::io::Pipe::new()));
        let progress = CollectingProgress::default();

        let result = operation
            .invoke(InvokeContext {
                store: &store,
                progress: &progress,
                source: &source,
                destination: None,
                writer: None,
            })
            .await;
        assert!(matches!(
            result,
            Err(MongrationError::SourceIncompatibility { .. })
        ));
    }

    #[tokio::test]
    async fn streaming_aggregation_batches_and_flushes_the_tail() {
        let (mem, store) = memory_store();
        let docs: Vec<Document> = (0..5).map(|i| doc(json!({"_id": i}))).collect();
        mem.insert_many("app", "src", docs);

        let operation = Operation::streaming_aggregation(vec![], 2);
        let source = Source::Collection(CollectionSource::new("app", "src"));
        let destination = Destination::Collection(CollectionDestination::new("app", "dst"));
        let mut writer = destination.open(&store).await.unwrap();
        let progress = CollectingProgress::default();

        let processed = operation
            .invoke(InvokeContext {
                store: &store,
                progress: &progress,
                source: &source,
                destination: Some(&destination),
                writer: Some(&mut writer),
            })
            .await
            .unwrap();
        writer.close().await.unwrap();

        assert_eq!(processed, 5);
        // Two full batches plus the final partial one.
        assert_eq!(mem.recorded_pipelines().len(), 3);
        assert_eq!(mem.documents("app", "dst").len(), 5);
    }
}
