//! # Mongrations
//!
//! A DAG-scheduled, streaming migration engine for document databases.
//!
//! A migration is a set of named **phases**, each pairing a data source with
//! a transform operation and a destination. Phases declare dependencies on
//! each other; the engine runs every phase as a concurrent task the moment
//! its dependencies allow, streaming documents between dependent phases
//! through in-process pipes instead of materializing intermediate
//! collections. Per-run progress is persisted so an interrupted batch can be
//! resumed or safely replayed.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mongrations::prelude::*;
//!
//! let mut migration = Migration::new("double-scores");
//!
//! let normalize = migration.phase("normalize");
//! normalize.from_collection("app", "scores");
//! normalize.transform(|mut doc| {
//!     if let Some(x) = doc.get("x").and_then(|v| v.as_i64()) {
//!         doc.insert("x".into(), (x * 2).into());
//!     }
//!     Ok(doc)
//! })?;
//!
//! let store_phase = migration.phase("store");
//! store_phase.from_phase(&normalize)?;
//! store_phase.into_collection("app", "scores_v2");
//! store_phase.transform(|doc| Ok(doc))?;
//!
//! Runner::new(store).run_all(vec![migration]).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod document;
pub mod engine;
pub mod errors;
pub mod graph;
pub mod io;
pub mod migration;
pub mod observability;
pub mod ops;
pub mod phase;
pub mod runner;
pub mod state;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::document::{deep_remove, deep_set, doc_id, Document};
    pub use crate::engine::{Engine, PhaseReport, ProgressSink, RunReport};
    pub use crate::errors::{ConfigurationError, MongrationError, Result};
    pub use crate::graph::{DependencyGraph, EdgeLabel, Graph, VertexId};
    pub use crate::io::{
        AggregationSource, CollectionDestination, CollectionSource, Destination, FileDestination,
        FileSource, Pipe, Source,
    };
    pub use crate::migration::Migration;
    pub use crate::ops::Operation;
    pub use crate::phase::PhaseHandle;
    pub use crate::runner::Runner;
    pub use crate::state::{PhaseRun, RunState, RunStatus};
    pub use crate::store::{DocumentStore, MemoryStore};
}
