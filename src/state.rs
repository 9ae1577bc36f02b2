//! Run-state records: which migrations ran, in what order, with what
//! outcome.
//!
//! State lives in the store itself, one document per migration run keyed
//! by a monotonically assigned index. Every write is an idempotent upsert
//! (`$set` for status transitions, `$addToSet` for per-phase progress) so
//! interrupted runs can be retried without corrupting history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::document::Document;
use crate::errors::{MongrationError, Result};
use crate::store::DocumentStore;

use futures::TryStreamExt;

/// Database holding run state.
pub const STATE_DATABASE: &str = "mongrations";

/// Collection holding run state.
pub const STATE_COLLECTION: &str = "state";

/// Lifecycle of a recorded migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// The run started and has not finished.
    WorkInProgress,
    /// The run failed; history beyond this point is suspect.
    Failed,
    /// The run finished successfully.
    Completed,
}

/// One phase's recorded contribution to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRun {
    /// Phase name.
    pub phase: String,
    /// Documents the phase processed.
    pub num_documents_iterated: u64,
}

/// A recorded migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Run order index; doubles as the document id.
    #[serde(rename = "_id")]
    pub index: u64,
    /// Migration name.
    pub name: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Per-phase progress recorded so far.
    #[serde(default)]
    pub phases_ran: Vec<PhaseRun>,
}

/// Loads all recorded runs, sorted by index.
///
/// # Errors
///
/// Fails when the store read fails or a record does not deserialize.
pub async fn load_states(store: &Arc<dyn DocumentStore>) -> Result<Vec<RunState>> {
    let mut cursor = store.find(STATE_DATABASE, STATE_COLLECTION, None).await?;
    let mut states = Vec::new();
    while let Some(doc) = cursor.try_next().await? {
        let state: RunState = serde_json::from_value(Value::Object(doc))?;
        states.push(state);
    }
    states.sort_by_key(|state| state.index);
    Ok(states)
}

/// Checks the completed-prefix invariant: a completed run must not be
/// preceded, in index order, by a run that is not completed.
///
/// # Errors
///
/// Returns [`MongrationError::HistoryInconsistency`] naming the earliest
/// offending pair.
pub fn check_history_health(states: &[RunState]) -> Result<()> {
    let mut sorted: Vec<&RunState> = states.iter().collect();
    sorted.sort_by_key(|state| state.index);

    let mut first_incomplete: Option<&RunState> = None;
    for state in sorted {
        match state.status {
            RunStatus::Completed => {
                if let Some(earlier) = first_incomplete {
                    return Err(MongrationError::HistoryInconsistency {
                        earlier: earlier.name.clone(),
                        later: state.name.clone(),
                    });
                }
            }
            RunStatus::WorkInProgress | RunStatus::Failed => {
                first_incomplete.get_or_insert(state);
            }
        }
    }
    Ok(())
}

/// Upserts the run's status and name under its index.
///
/// # Errors
///
/// Fails when the store write fails.
pub async fn set_status(
    store: &Arc<dyn DocumentStore>,
    index: u64,
    name: &str,
    status: RunStatus,
) -> Result<()> {
    let filter = id_filter(index);
    let update = object(json!({
        "$set": {"name": name, "status": serde_json::to_value(status)?}
    }))?;
    store
        .update_one(STATE_DATABASE, STATE_COLLECTION, &filter, &update, true)
        .await
}

/// Records a phase's contribution to the run. `$addToSet` keeps the write
/// idempotent under retries.
///
/// # Errors
///
/// Fails when the store write fails.
pub async fn record_phase(
    store: &Arc<dyn DocumentStore>,
    index: u64,
    phase: &str,
    documents: u64,
) -> Result<()> {
    let entry = serde_json::to_value(PhaseRun {
        phase: phase.to_string(),
        num_documents_iterated: documents,
    })?;
    let filter = id_filter(index);
    let update = object(json!({"$addToSet": {"phases_ran": entry}}))?;
    store
        .update_one(STATE_DATABASE, STATE_COLLECTION, &filter, &update, true)
        .await
}

/// Index for the next new run: one past the highest recorded index.
#[must_use]
pub fn next_index(states: &[RunState]) -> u64 {
    states
        .iter()
        .map(|state| state.index + 1)
        .max()
        .unwrap_or(0)
}

/// Index already assigned to the named migration, if any. A retried run
/// keeps its original slot in history.
#[must_use]
pub fn find_index(states: &[RunState], name: &str) -> Option<u64> {
    states
        .iter()
        .find(|state| state.name == name)
        .map(|state| state.index)
}

/// Whether the named migration has a completed run on record.
#[must_use]
pub fn is_completed(states: &[RunState], name: &str) -> bool {
    states
        .iter()
        .any(|state| state.name == name && state.status == RunStatus::Completed)
}

fn id_filter(index: u64) -> Document {
    let mut filter = Document::new();
    filter.insert("_id".into(), json!(index));
    filter
}

fn object(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(MongrationError::Internal(format!(
            "expected object update document, got {other}"
        ))),
    }
}
