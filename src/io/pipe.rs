//! In-process streaming channel between a producer and a consumer phase.

use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::document::{Document, DocumentStream};
use crate::errors::{MongrationError, Result};

/// The total-count hint: unset until a writer provides one; the provided
/// estimate itself may be unknown.
type Hint = Option<Option<u64>>;

/// A single-producer/single-consumer document stream with a deferred
/// total-count hint.
///
/// The producer phase pushes documents as it emits them and closes the pipe
/// when done; closing drops the sender, which terminates the consumer's
/// stream once the queue drains. The consumer's [`cursor`](Pipe::cursor)
/// suspends until the producer has hinted its total count, so the consumer
/// can report accurate progress before the first document arrives.
#[derive(Debug)]
pub struct Pipe {
    sender: Mutex<Option<mpsc::UnboundedSender<Document>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Document>>>,
    hint_tx: watch::Sender<Hint>,
    hint_rx: watch::Receiver<Hint>,
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe {
    /// Creates an open, unhinted pipe.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (hint_tx, hint_rx) = watch::channel(None);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            hint_tx,
            hint_rx,
        }
    }

    /// Enqueues a document for the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`MongrationError::PipeClosed`] when the pipe was closed or
    /// the consumer is gone; pushing after close is a programming error.
    pub fn push(&self, doc: Document) -> Result<()> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(doc).map_err(|_| MongrationError::PipeClosed),
            None => Err(MongrationError::PipeClosed),
        }
    }

    /// Closes the pipe. The consumer's stream terminates once the remaining
    /// queue is drained. Idempotent.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Whether [`close`](Pipe::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Provides the total-count hint. First write wins; later calls are
    /// ignored.
    pub fn hint_total(&self, estimate: Option<u64>) {
        self.hint_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(estimate);
                true
            } else {
                false
            }
        });
    }

    /// Opens the consumer side: waits for the total-count hint, then
    /// returns the document stream and the hinted estimate.
    ///
    /// # Errors
    ///
    /// Fails when called a second time; a pipe has exactly one consumer.
    pub async fn cursor(&self) -> Result<(DocumentStream, Option<u64>)> {
        let mut hint_rx = self.hint_rx.clone();
        let estimate = *hint_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MongrationError::Internal("pipe hint channel dropped".into()))?;
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| MongrationError::Internal("pipe already has a consumer".into()))?;

        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|doc| (Ok(doc), rx))
        })
        .boxed();
        Ok((stream, estimate.flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn doc(id: i64) -> Document {
        let mut d = Document::new();
        d.insert("_id".into(), json!(id));
        d
    }

    #[tokio::test]
    async fn round_trip_preserves_order() {
        let pipe = Pipe::new();
        pipe.hint_total(Some(3));
        for i in 0..3 {
            pipe.push(doc(i)).unwrap();
        }
        pipe.close();

        let (stream, estimate) = pipe.cursor().await.unwrap();
        assert_eq!(estimate, Some(3));
        let docs: Vec<Document> = stream.try_collect().await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.get("_id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]);
    }

    #[tokio::test]
    async fn consumer_drains_concurrently_with_producer() {
        let pipe = Arc::new(Pipe::new());
        let producer = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move {
                pipe.hint_total(Some(100));
                for i in 0..100 {
                    pipe.push(doc(i)).unwrap();
                    tokio::task::yield_now().await;
                }
                pipe.close();
            })
        };

        let (stream, _) = pipe.cursor().await.unwrap();
        let docs: Vec<Document> = stream.try_collect().await.unwrap();
        assert_eq!(docs.len(), 100);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let pipe = Pipe::new();
        pipe.close();
        assert!(matches!(pipe.push(doc(1)), Err(MongrationError::PipeClosed)));
    }

    #[tokio::test]
    async fn hint_first_write_wins() {
        let pipe = Pipe::new();
        pipe.hint_total(Some(5));
        pipe.hint_total(Some(99));
        pipe.close();
        let (_, estimate) = pipe.cursor().await.unwrap();
        assert_eq!(estimate, Some(5));
    }

    #[tokio::test]
    async fn cursor_waits_for_hint() {
        let pipe = Arc::new(Pipe::new());
        let reader = {
            let pipe = Arc::clone(&pipe);
            tokio::spawn(async move { pipe.cursor().await.map(|(_, estimate)| estimate) })
        };
        // The reader cannot finish until a hint is provided.
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        pipe.hint_total(None);
        let estimate = reader.await.unwrap().unwrap();
        assert_eq!(estimate, None);
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let pipe = Pipe::new();
        pipe.hint_total(None);
        pipe.close();
        let _first = pipe.cursor().await.unwrap();
        assert!(pipe.cursor().await.is_err());
    }
}
