//! File import and callback export operations.

use futures::TryStreamExt;

use crate::errors::{MongrationError, Result};
use crate::io::Source;

use super::{ExportFn, InvokeContext, TransformFn, YIELD_BATCH};

/// Maps entries of a JSON document-array file into the destination.
#[derive(Clone)]
pub struct ImportOperation {
    callback: TransformFn,
}

impl ImportOperation {
    pub(crate) fn new(callback: TransformFn) -> Self {
        Self { callback }
    }

    pub(crate) async fn invoke(&self, mut ctx: InvokeContext<'_>) -> Result<u64> {
        if !matches!(ctx.source, Source::File(_)) {
            return Err(MongrationError::SourceIncompatibility {
                operation: "import".to_string(),
                source_kind: ctx.source.to_string(),
            });
        }
        let (mut cursor, estimate) = ctx.source.cursor(ctx.store).await?;
        ctx.progress.set_total(estimate);
        if let Some(writer) = ctx.writer.as_deref_mut() {
            writer.hint_total(estimate);
        }

        let mut processed = 0u64;
        let mut since_yield = 0usize;
        while let Some(entry) = cursor.try_next().await? {
            let doc = (self.callback)(entry).map_err(MongrationError::callback)?;
            if let Some(writer) = ctx.writer.as_deref_mut() {
                writer.push(doc).await?;
            }
            processed += 1;
            ctx.progress.inc(1);
            since_yield += 1;
            if since_yield >= YIELD_BATCH {
                tokio::task::yield_now().await;
                since_yield = 0;
            }
        }
        Ok(processed)
    }
}

/// Hands every source document to a user callback, e.g. to post each one
/// to an external system.
#[derive(Clone)]
pub struct ExportOperation {
    callback: ExportFn,
}

impl ExportOperation {
    pub(crate) fn new(callback: ExportFn) -> Self {
        Self { callback }
    }

    pub(crate) async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<u64> {
        let (mut cursor, estimate) = ctx.source.cursor(ctx.store).await?;
        ctx.progress.set_total(estimate);

        let mut processed = 0u64;
        let mut since_yield = 0usize;
        while let Some(doc) = cursor.try_next().await? {
            (self.callback)(doc).map_err(MongrationError::callback)?;
            processed += 1;
            ctx.progress.inc(1);
            since_yield += 1;
            if since_yield >= YIELD_BATCH {
                tokio::task::yield_now().await;
                since_yield = 0;
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::document::Document;
    use crate::engine::CollectingProgress;
    use crate::errors::MongrationError;
    use crate::io::{CollectionDestination, CollectionSource, Destination, FileSource, Source};
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
    async fn import_maps_file_entries_into_collection() {
        let (mem, store) = memory_store();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"code": "FR"}}, {{"code": "DE"}}]"#).unwrap();

        let operation = Operation::import(|mut entry: Document| {
            let code = entry
                .remove("code")
                .ok_or_else(|| anyhow::anyhow!("entry without code"))?;
            let mut d = Document::new();
            d.insert("_id".into(), code);
            Ok(d)
        });
        let source = Source::File(FileSource {
            path: file.path().to_path_buf(),
        });
        let destination = Destination::Collection(CollectionDestination::new("app", "countries"));
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
        let out = mem.documents("app", "countries");
        assert_eq!(out[0].get("_id"), Some(&json!("FR")));
    }

    #[tokio::test]
    async fn import_rejects_collection_source() {
        let (_, store) = memory_store();
        let operation = Operation::import(|d: Document| Ok(d));
        let source = Source::Collection(CollectionSource::new("app", "src"));
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
    async fn export_hands_every_document_to_the_callback() {
        let (mem, store) = memory_store();
        mem.insert_many(
            "app",
            "src",
            vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let operation = Operation::export(move |d: Document| {
            sink.lock().unwrap().push(d);
            Ok(())
        });
        let source = Source::Collection(CollectionSource::new("app", "src"));
        let progress = CollectingProgress::default();

        let processed = operation
            .invoke(InvokeContext {
                store: &store,
                progress: &progress,
                source: &source,
                destination: None,
                writer: None,
            })
            .await
            .unwrap();

        assert_eq!(processed, 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
