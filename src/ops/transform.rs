//! Per-document transform operation.

use futures::TryStreamExt;

use crate::errors::{MongrationError, Result};

use super::{InvokeContext, TransformFn, YIELD_BATCH};

/// Streams the source through a user callback, one document at a time.
#[derive(Clone)]
pub struct TransformOperation {
    callback: TransformFn,
}

impl TransformOperation {
    pub(crate) fn new(callback: TransformFn) -> Self {
        Self { callback }
    }

    pub(crate) async fn invoke(&self, mut ctx: InvokeContext<'_>) -> Result<u64> {
        let (mut cursor, estimate) = ctx.source.cursor(ctx.store).await?;
        ctx.progress.set_total(estimate);
        if let Some(writer) = ctx.writer.as_deref_mut() {
            writer.hint_total(estimate);
        }

        let mut processed = 0u64;
        let mut since_yield = 0usize;
        while let Some(doc) = cursor.try_next().await? {
            let out = (self.callback)(doc).map_err(MongrationError::callback)?;
            if let Some(writer) = ctx.writer.as_deref_mut() {
                writer.push(out).await?;
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
