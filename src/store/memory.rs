//! In-memory document store.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::document::{Document, DocumentStream};
use crate::errors::{MongrationError, Result};

use super::DocumentStore;

type CollectionKey = (String, String);

/// An in-process [`DocumentStore`] backed by hash maps.
///
/// Supports exactly the query surface the engine itself emits: equality
/// filters, `$set`/`$addToSet` updates, and aggregation pipelines made of
/// `$documents`, `$match` and `$out` stages. Received aggregation pipelines
/// are recorded so tests can assert on what the engine sent.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<CollectionKey, Vec<Document>>>,
    pipelines: Mutex<Vec<(CollectionKey, Vec<Value>)>>,
    indexes: Mutex<Vec<(CollectionKey, Document)>>,
}

fn key(database: &str, collection: &str) -> CollectionKey {
    (database.to_string(), collection.to_string())
}

fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, value)| doc.get(field) == Some(value))
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a collection with documents (test/setup helper).
    pub fn insert_many(&self, database: &str, collection: &str, documents: Vec<Document>) {
        let mut collections = self.collections.write();
        collections
            .entry(key(database, collection))
            .or_default()
            .extend(documents);
    }

    /// Returns a snapshot of a collection's documents.
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(&key(database, collection))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether the collection exists (has ever been written).
    pub fn has_collection(&self, database: &str, collection: &str) -> bool {
        self.collections.read().contains_key(&key(database, collection))
    }

    /// Every `(database, collection)` pair written so far, sorted.
    pub fn collection_names(&self) -> Vec<(String, String)> {
        let mut names: Vec<_> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Aggregation pipelines received so far, in call order.
    pub fn recorded_pipelines(&self) -> Vec<Vec<Value>> {
        self.pipelines.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Index specifications created so far.
    pub fn recorded_indexes(&self) -> Vec<Document> {
        self.indexes.lock().iter().map(|(_, keys)| keys.clone()).collect()
    }

    fn apply_upsert(&self, database: &str, collection: &str, documents: Vec<Document>) {
        let mut collections = self.collections.write();
        let target = collections.entry(key(database, collection)).or_default();
        for doc in documents {
            match doc.get("_id") {
                Some(id) => {
                    let id = id.clone();
                    if let Some(existing) =
                        target.iter_mut().find(|d| d.get("_id") == Some(&id))
                    {
                        *existing = doc;
                    } else {
                        target.push(doc);
                    }
                }
                None => target.push(doc),
            }
        }
    }

    fn evaluate_pipeline(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<Vec<Document>> {
        let mut docs = self.documents(database, collection);
        let mut out_target: Option<CollectionKey> = None;

        for (position, stage) in pipeline.iter().enumerate() {
            let stage = stage
                .as_object()
                .ok_or_else(|| MongrationError::Storage("pipeline stage is not an object".into()))?;
            let (operator, spec) = stage
                .iter()
                .next()
                .ok_or_else(|| MongrationError::Storage("empty pipeline stage".into()))?;

            match operator.as_str() {
                "$documents" if position == 0 => {
                    let entries = spec.as_array().ok_or_else(|| {
                        MongrationError::Storage("$documents expects an array".into())
                    })?;
                    docs = entries
                        .iter()
                        .filter_map(|v| v.as_object().cloned())
                        .collect();
                }
                "$match" => {
                    let filter = spec.as_object().ok_or_else(|| {
                        MongrationError::Storage("$match expects an object".into())
                    })?;
                    docs.retain(|doc| matches(doc, filter));
                }
                "$out" => {
                    out_target = Some(match spec {
                        Value::String(coll) => key(database, coll),
                        Value::Object(target) => {
                            let db = target.get("db").and_then(Value::as_str);
                            let coll = target.get("coll").and_then(Value::as_str);
                            match (db, coll) {
                                (Some(db), Some(coll)) => key(db, coll),
                                _ => {
                                    return Err(MongrationError::Storage(
                                        "$out expects {db, coll}".into(),
                                    ))
                                }
                            }
                        }
                        _ => {
                            return Err(MongrationError::Storage(
                                "$out expects a string or object".into(),
                            ))
                        }
                    });
                }
                other => {
                    return Err(MongrationError::Storage(format!(
                        "unsupported aggregation stage: {other}"
                    )))
                }
            }
        }

        if let Some((db, coll)) = out_target {
            self.apply_upsert(&db, &coll, std::mem::take(&mut docs));
        }
        Ok(docs)
    }
}

fn into_stream(docs: Vec<Document>) -> DocumentStream {
    stream::iter(docs.into_iter().map(Ok)).boxed()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(
        &self,
        database: &str,
        collection: &str,
        filter: Option<&Document>,
    ) -> Result<DocumentStream> {
        let mut docs = self.documents(database, collection);
        if let Some(filter) = filter {
            docs.retain(|doc| matches(doc, filter));
        }
        Ok(into_stream(docs))
    }

    async fn estimated_count(&self, database: &str, collection: &str) -> Result<u64> {
        Ok(self.documents(database, collection).len() as u64)
    }

    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: &[Value],
    ) -> Result<DocumentStream> {
        self.pipelines
            .lock()
            .push((key(database, collection), pipeline.to_vec()));
        let docs = self.evaluate_pipeline(database, collection, pipeline)?;
        Ok(into_stream(docs))
    }

    async fn bulk_upsert(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<()> {
        self.apply_upsert(database, collection, documents);
        Ok(())
    }

    async fn update_one(
        &self,
        database: &str,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let target = collections.entry(key(database, collection)).or_default();

        let index = match target.iter().position(|d| matches(d, filter)) {
            Some(index) => index,
            None if upsert => {
                target.push(filter.clone());
                target.len() - 1
            }
            None => return Ok(()),
        };
        let doc = &mut target[index];

        for (operator, spec) in update {
            let fields = spec.as_object().ok_or_else(|| {
                MongrationError::Storage(format!("{operator} expects an object"))
            })?;
            match operator.as_str() {
                "$set" => {
                    for (field, value) in fields {
                        doc.insert(field.clone(), value.clone());
                    }
                }
                "$addToSet" => {
                    for (field, value) in fields {
                        let entry = doc
                            .entry(field.clone())
                            .or_insert_with(|| Value::Array(Vec::new()));
                        let Some(set) = entry.as_array_mut() else {
                            return Err(MongrationError::Storage(format!(
                                "$addToSet target '{field}' is not an array"
                            )));
                        };
                        if !set.contains(value) {
                            set.push(value.clone());
                        }
                    }
                }
                other => {
                    return Err(MongrationError::Storage(format!(
                        "unsupported update operator: {other}"
                    )))
                }
            }
        }
        Ok(())
    }

    async fn create_index(
        &self,
        database: &str,
        collection: &str,
        keys: &Document,
    ) -> Result<String> {
        self.indexes
            .lock()
            .push((key(database, collection), keys.clone()));
        let name = keys
            .iter()
            .map(|(field, order)| format!("{field}_{order}"))
            .collect::<Vec<_>>()
            .join("_");
        Ok(name)
    }

    async fn rename_collection(
        &self,
        database: &str,
        collection: &str,
        new_name: &str,
    ) -> Result<()> {
        let mut collections = self.collections.write();
        let docs = collections.remove(&key(database, collection)).ok_or_else(|| {
            MongrationError::Storage(format!("collection not found: {database}/{collection}"))
        })?;
        collections.insert(key(database, new_name), docs);
        Ok(())
    }

    async fn drop_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.collections.write().remove(&key(database, collection));
        Ok(())
    }
}
