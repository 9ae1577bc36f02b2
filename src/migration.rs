//! A named, ordered collection of phases.

use std::collections::HashSet;

use crate::errors::{ConfigurationError, Result};
use crate::graph::DependencyGraph;
use crate::phase::PhaseHandle;

/// A migration: a named set of phases forming a dependency graph.
///
/// Migrations run in lexicographic name order, so a sortable prefix such
/// as `0001-` keeps history deterministic.
pub struct Migration {
    name: String,
    stateless: bool,
    phases: Vec<PhaseHandle>,
}

impl Migration {
    /// Creates an empty, stateful migration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stateless: false,
            phases: Vec::new(),
        }
    }

    /// Marks the migration stateless: it runs on every invocation and
    /// leaves no record in the state collection.
    #[must_use]
    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }

    /// The migration name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this migration bypasses state tracking.
    #[must_use]
    pub fn is_stateless(&self) -> bool {
        self.stateless
    }

    /// Adds a phase and returns its handle for chained configuration.
    pub fn phase(&mut self, name: impl Into<String>) -> PhaseHandle {
        let handle = PhaseHandle::new(name);
        self.phases.push(handle.clone());
        handle
    }

    /// The phases in declaration order.
    #[must_use]
    pub fn phases(&self) -> &[PhaseHandle] {
        &self.phases
    }

    /// Checks that every phase is runnable: unique names, an operation
    /// attached, and the source/destination its operation requires.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigurationError`] naming every offending
    /// phase.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();
        let mut offenders: Vec<String> = Vec::new();

        let mut seen = HashSet::new();
        for phase in &self.phases {
            let name = phase.name();
            if !seen.insert(name.clone()) {
                problems.push(format!("duplicate phase name '{name}'"));
                offenders.push(name.clone());
            }
        }

        for phase in &self.phases {
            let name = phase.name();
            let Some(operation) = phase.operation() else {
                problems.push(format!("phase '{name}' has no operation"));
                offenders.push(name);
                continue;
            };
            if operation.needs_source() && phase.source().is_none() {
                problems.push(format!("phase '{name}' has no source"));
                offenders.push(name.clone());
            }
            if operation.needs_destination() && phase.destination().is_none() {
                problems.push(format!("phase '{name}' has no destination"));
                offenders.push(name);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::new(format!(
                "migration '{}' is not runnable: {}",
                self.name,
                problems.join("; ")
            ))
            .with_phases(offenders)
            .into())
        }
    }

    /// Builds the phase dependency graph from the declared edges.
    ///
    /// # Errors
    ///
    /// Fails when a phase depends on a phase outside this migration.
    pub fn build_graph(&self) -> Result<DependencyGraph<PhaseHandle>> {
        let mut graph = DependencyGraph::new();
        let ids: Vec<_> = self
            .phases
            .iter()
            .map(|phase| graph.add(phase.clone()))
            .collect();

        for (index, phase) in self.phases.iter().enumerate() {
            for dependency in phase.dependencies() {
                let Some(position) = self.phases.iter().position(|p| p.ptr_eq(&dependency)) else {
                    return Err(ConfigurationError::new(format!(
                        "phase '{}' depends on phase '{}', which is not part of migration '{}'",
                        phase.name(),
                        dependency.name(),
                        self.name
                    ))
                    .with_phases(vec![phase.name(), dependency.name()])
                    .into());
                };
                graph.add_dependency(ids[index], ids[position]);
            }
        }
        Ok(graph)
    }
}
