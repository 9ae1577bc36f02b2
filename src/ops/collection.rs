//! Collection maintenance operations: index creation, rename, drop.

use tracing::info;

use crate::document::Document;
use crate::errors::Result;

use super::{require_collection_source, InvokeContext};

/// Creates an index on the source collection.
#[derive(Clone)]
pub struct IndexOperation {
    keys: Document,
}

impl IndexOperation {
    pub(crate) fn new(keys: Document) -> Self {
        Self { keys }
    }

    pub(crate) async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<u64> {
        let src = require_collection_source("create-index", ctx.source)?;
        ctx.progress.set_total(Some(1));
        let name = ctx
            .store
            .create_index(&src.database, &src.collection, &self.keys)
            .await?;
        info!(
            database = %src.database,
            collection = %src.collection,
            index = %name,
            "index created"
        );
        ctx.progress.inc(1);
        Ok(1)
    }
}

/// Renames the source collection within its database.
#[derive(Clone)]
pub struct RenameCollectionOperation {
    new_name: String,
}

impl RenameCollectionOperation {
    pub(crate) fn new(new_name: impl Into<String>) -> Self {
        Self {
            new_name: new_name.into(),
        }
    }

    pub(crate) async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<u64> {
        let src = require_collection_source("rename-collection", ctx.source)?;
        ctx.progress.set_total(Some(1));
        ctx.store
            .rename_collection(&src.database, &src.collection, &self.new_name)
            .await?;
        ctx.progress.inc(1);
        Ok(1)
    }
}

/// Drops the source collection.
#[derive(Clone)]
pub struct DropCollectionOperation;

impl DropCollectionOperation {
    pub(crate) async fn invoke(&self, ctx: InvokeContext<'_>) -> Result<u64> {
        let src = require_collection_source("drop-collection", ctx.source)?;
        ctx.progress.set_total(Some(1));
        ctx.store
            .drop_collection(&src.database, &src.collection)
            .await?;
        ctx.progress.inc(1);
        Ok(1)
    }
}
