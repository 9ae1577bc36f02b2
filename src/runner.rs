//! The runner: state-aware orchestration over a batch of migrations.
//!
//! Sorts migrations by name, checks history health, skips runs already
//! completed, and brackets each remaining run with state writes so an
//! interrupted process leaves an honest record behind.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::{self, Engine, RunReport};
use crate::errors::Result;
use crate::migration::Migration;
use crate::state::{self, RunState, RunStatus};
use crate::store::DocumentStore;

/// Runs batches of migrations against a store, tracking completion state.
pub struct Runner {
    store: Arc<dyn DocumentStore>,
    engine: Engine,
}

impl Runner {
    /// Creates a runner with the default engine.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            engine: Engine::default(),
        }
    }

    /// Replaces the engine, e.g. to install a custom progress factory.
    #[must_use]
    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    /// Runs every pending migration, in lexicographic name order.
    ///
    /// A migration is pending when it is stateless or has no completed run
    /// on record. The first failure stops the batch; migrations after the
    /// failed one do not run.
    ///
    /// # Errors
    ///
    /// Propagates history inconsistencies, state read/write failures and
    /// the first failed run.
    pub async fn run_all(&self, mut migrations: Vec<Migration>) -> Result<Vec<RunReport>> {
        migrations.sort_by(|a, b| a.name().cmp(b.name()));

        // Stateless-only batches never touch the state collection; a
        // corrupt history cannot block them.
        let states = if migrations.iter().all(Migration::is_stateless) {
            Vec::new()
        } else {
            let states = state::load_states(&self.store).await?;
            state::check_history_health(&states)?;
            states
        };

        let pending: Vec<Migration> = migrations
            .into_iter()
            .filter(|migration| {
                migration.is_stateless() || !state::is_completed(&states, migration.name())
            })
            .collect();
        if pending.is_empty() {
            info!("all migrations are up to date");
            return Ok(Vec::new());
        }

        // Configuration problems anywhere in the batch abort it before any
        // migration executes or any state is written.
        for migration in &pending {
            let _ = engine::plan(migration)?;
        }
        info!(count = pending.len(), "migrations to run");

        let mut next_index = state::next_index(&states);
        let mut reports = Vec::with_capacity(pending.len());
        for migration in &pending {
            let report = self.run_one(&states, &mut next_index, migration).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_one(
        &self,
        states: &[RunState],
        next_index: &mut u64,
        migration: &Migration,
    ) -> Result<RunReport> {
        if migration.is_stateless() {
            debug!(migration = %migration.name(), "stateless; running without state tracking");
            return self.engine.run(&self.store, migration).await;
        }

        // A retried run keeps the index of its earlier attempt.
        let index = match state::find_index(states, migration.name()) {
            Some(index) => index,
            None => {
                let index = *next_index;
                *next_index += 1;
                index
            }
        };
        state::set_status(&self.store, index, migration.name(), RunStatus::WorkInProgress).await?;

        // Record each phase as soon as it completes, so a crash mid-run
        // leaves the partial progress on record.
        for phase in migration.phases() {
            let store = Arc::clone(&self.store);
            let phase_name = phase.name();
            phase.on_completed(move |documents| {
                tokio::spawn(async move {
                    if let Err(err) = state::record_phase(&store, index, &phase_name, documents).await
                    {
                        warn!(error = %err, phase = %phase_name, "failed to record phase progress");
                    }
                });
            });
        }

        match self.engine.run(&self.store, migration).await {
            Ok(report) => {
                // The spawned recordings may still be in flight; write the
                // full set again before marking the run complete. The
                // $addToSet semantics make the overlap harmless.
                for phase in &report.phases {
                    state::record_phase(&self.store, index, &phase.phase, phase.documents).await?;
                }
                state::set_status(&self.store, index, migration.name(), RunStatus::Completed)
                    .await?;
                info!(migration = %migration.name(), "migration recorded as completed");
                Ok(report)
            }
            Err(err) => {
                if let Err(write_err) =
                    state::set_status(&self.store, index, migration.name(), RunStatus::Failed).await
                {
                    warn!(error = %write_err, "failed to record FAILED status");
                }
                Err(err)
            }
        }
    }
}
