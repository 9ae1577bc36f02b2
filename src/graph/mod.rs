//! Dependency graph structures and traversal.
//!
//! This module provides:
//! - An index-addressed adjacency arena with slot reuse
//! - A typed dependency wrapper tracking the independent set
//! - A ready-order traversal that visits a vertex only after all of its
//!   dependencies have been visited

mod arena;
mod dependency;

pub use arena::{EdgeLabel, Graph, VertexId};
pub use dependency::DependencyGraph;
