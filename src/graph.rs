//! Flow definition and step routing.
//!
//! This module provides [`StepGraph`] and [`FlowBuilder`] for declaring a
//! flow's steps and validating the routing between them. Every declared edge
//! (fixed successors and every declared branch target) is recorded in a
//! petgraph DAG so that cycles and unreachable steps are caught when the flow
//! is built, not while a user is halfway through it.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, VisitMap};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::{
    FieldStore, PersistenceAdapter, Result, Routing, StepDefinition, StepKey, StepwiseError,
};

/// The static step graph of one flow.
///
/// # Construction
///
/// ```
/// use stepwise::{FieldStore, StepGraph, StepKey};
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// enum Step { Start, Extra, Finish }
///
/// impl StepKey for Step {
///     fn name(&self) -> &'static str {
///         match self { Step::Start => "start", Step::Extra => "extra", Step::Finish => "finish" }
///     }
/// }
///
/// let graph = StepGraph::builder("demo")
///     .branch(Step::Start, [Step::Extra, Step::Finish], |fields: &FieldStore| {
///         if fields.flag("wants_extra") { Step::Extra } else { Step::Finish }
///     })
///     .fixed(Step::Extra, Step::Finish)
///     .terminal(Step::Finish)
///     .build()?;
///
/// assert_eq!(graph.next_step_of(Step::Start, &FieldStore::new())?, Some(Step::Finish));
/// # Ok::<(), stepwise::StepwiseError>(())
/// ```
pub struct StepGraph<S: StepKey> {
    flow_id: String,
    graph: DiGraph<S, ()>,
    index: HashMap<S, NodeIndex>,
    /// Definitions in declaration order.
    definitions: Vec<StepDefinition<S>>,
    positions: HashMap<S, usize>,
}

impl<S: StepKey> StepGraph<S> {
    /// Creates a new flow builder.
    pub fn builder(flow_id: impl Into<String>) -> FlowBuilder<S> {
        FlowBuilder::new(flow_id)
    }

    /// Returns the flow identifier.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Returns the step a fresh session starts on.
    pub fn first_step(&self) -> S {
        // Non-empty is checked by the builder.
        self.definitions[0].id
    }

    /// Returns all steps in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = S> + '_ {
        self.definitions.iter().map(|d| d.id)
    }

    /// Returns the number of steps.
    pub fn step_count(&self) -> usize {
        self.definitions.len()
    }

    /// Returns true if the step belongs to this flow.
    pub fn has_step(&self, step: S) -> bool {
        self.positions.contains_key(&step)
    }

    /// Returns the definition of `step`.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Configuration`] if the step is unknown.
    pub fn definition(&self, step: S) -> Result<&StepDefinition<S>> {
        self.positions
            .get(&step)
            .map(|&pos| &self.definitions[pos])
            .ok_or_else(|| {
                StepwiseError::Configuration(format!(
                    "step `{}` is not part of flow `{}`",
                    step.name(),
                    self.flow_id
                ))
            })
    }

    /// Returns true if `step` ends the flow.
    pub fn is_terminal(&self, step: S) -> bool {
        self.definition(step)
            .map(StepDefinition::is_terminal)
            .unwrap_or(false)
    }

    /// Returns the persistence adapter of `step`, if it persists.
    pub fn adapter_for(&self, step: S) -> Option<Arc<dyn PersistenceAdapter>> {
        self.definition(step).ok().and_then(|d| d.persist.clone())
    }

    /// Returns the 0-based declaration position of `step`, for display.
    pub fn position_of(&self, step: S) -> Option<usize> {
        self.positions.get(&step).copied()
    }

    /// Returns the terminal steps in declaration order.
    pub fn terminal_steps(&self) -> Vec<S> {
        self.definitions
            .iter()
            .filter(|d| d.is_terminal())
            .map(|d| d.id)
            .collect()
    }

    /// Returns every step `step` may route to.
    pub fn successors(&self, step: S) -> Vec<S> {
        self.neighbors(step, petgraph::Direction::Outgoing)
    }

    /// Returns every step that may route to `step`.
    pub fn predecessors(&self, step: S) -> Vec<S> {
        self.neighbors(step, petgraph::Direction::Incoming)
    }

    fn neighbors(&self, step: S, direction: petgraph::Direction) -> Vec<S> {
        let Some(&node) = self.index.get(&step) else {
            return Vec::new();
        };
        let mut out: Vec<S> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|idx| self.graph[idx])
            .collect();
        out.sort_by_key(|s| self.positions.get(s).copied());
        out.dedup();
        out
    }

    /// Computes the successor of `step` from the given field snapshot.
    ///
    /// Returns `Ok(None)` for terminal steps. The function is pure: it only
    /// evaluates routing and never touches session state.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Configuration`] if the step is unknown or a
    /// branch selector returns a step it did not declare.
    pub fn next_step_of(&self, step: S, fields: &FieldStore) -> Result<Option<S>> {
        let definition = self.definition(step)?;
        let next = match &definition.routing {
            Routing::Terminal => return Ok(None),
            Routing::Fixed(next) => *next,
            Routing::Branch { targets, selector } => {
                let chosen = selector(fields);
                if !targets.contains(&chosen) {
                    return Err(StepwiseError::Configuration(format!(
                        "branch at `{}` chose undeclared step `{}`",
                        step.name(),
                        chosen.name()
                    )));
                }
                chosen
            }
        };
        debug!(from = step.name(), to = next.name(), "routed");
        Ok(Some(next))
    }

    /// Returns the path the flow takes from its first step to `target`
    /// under the given fields, including both ends.
    ///
    /// Returns `None` if `target` is not reached (e.g. it lies on a branch
    /// the fields do not select).
    pub fn path_to(&self, target: S, fields: &FieldStore) -> Option<Vec<S>> {
        let mut path = vec![self.first_step()];
        let mut current = self.first_step();
        // Acyclic, so the walk is bounded by the step count.
        for _ in 0..self.step_count() {
            if current == target {
                return Some(path);
            }
            match self.next_step_of(current, fields) {
                Ok(Some(next)) => {
                    path.push(next);
                    current = next;
                }
                Ok(None) | Err(_) => return None,
            }
        }
        (current == target).then_some(path)
    }
}

impl<S: StepKey> fmt::Debug for StepGraph<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.steps().map(|s| s.name()).collect();
        f.debug_struct("StepGraph")
            .field("flow_id", &self.flow_id)
            .field("steps", &names)
            .field("step_count", &self.step_count())
            .finish()
    }
}

/// A deferred adapter attachment, resolved at build time.
struct DeferredAdapter<S> {
    step: S,
    adapter: Arc<dyn PersistenceAdapter>,
}

/// Builder for constructing [`StepGraph`] instances.
///
/// Steps are declared in display order; the first declared step is where a
/// fresh session starts.
pub struct FlowBuilder<S: StepKey> {
    flow_id: String,
    definitions: Vec<StepDefinition<S>>,
    deferred_adapters: Vec<DeferredAdapter<S>>,
    duplicates: Vec<S>,
}

impl<S: StepKey> FlowBuilder<S> {
    fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            definitions: Vec::new(),
            deferred_adapters: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    fn push(mut self, definition: StepDefinition<S>) -> Self {
        if self.definitions.iter().any(|d| d.id == definition.id) {
            self.duplicates.push(definition.id);
        } else {
            self.definitions.push(definition);
        }
        self
    }

    /// Declares a step that always continues to `next`.
    pub fn fixed(self, step: S, next: S) -> Self {
        self.push(StepDefinition::new(step, Routing::Fixed(next)))
    }

    /// Declares a step whose successor is chosen by `selector`.
    ///
    /// `targets` lists every step the selector may return.
    pub fn branch<F>(self, step: S, targets: impl IntoIterator<Item = S>, selector: F) -> Self
    where
        F: Fn(&FieldStore) -> S + Send + Sync + 'static,
    {
        self.push(StepDefinition::new(
            step,
            Routing::Branch {
                targets: targets.into_iter().collect(),
                selector: Arc::new(selector),
            },
        ))
    }

    /// Declares a terminal step.
    pub fn terminal(self, step: S) -> Self {
        self.push(StepDefinition::new(step, Routing::Terminal))
    }

    /// Attaches a persistence adapter to a declared step.
    pub fn persist(mut self, step: S, adapter: impl PersistenceAdapter + 'static) -> Self {
        self.deferred_adapters.push(DeferredAdapter {
            step,
            adapter: Arc::new(adapter),
        });
        self
    }

    /// Attaches an already shared persistence adapter to a declared step.
    pub fn persist_shared(mut self, step: S, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.deferred_adapters.push(DeferredAdapter { step, adapter });
        self
    }

    /// Builds the flow, validating its structure.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::Configuration`] if the flow is empty, has a
    /// duplicate step, routes to an undeclared step, declares an empty
    /// branch, has no terminal step, contains a cycle, or has steps that
    /// cannot be reached from the first step.
    pub fn build(mut self) -> Result<StepGraph<S>> {
        let config_error = |msg: String| Err(StepwiseError::Configuration(msg));

        if let Some(dup) = self.duplicates.first() {
            return config_error(format!("duplicate step `{}`", dup.name()));
        }
        if self.definitions.is_empty() {
            return config_error(format!("flow `{}` has no steps", self.flow_id));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut positions = HashMap::new();
        for (pos, definition) in self.definitions.iter().enumerate() {
            index.insert(definition.id, graph.add_node(definition.id));
            positions.insert(definition.id, pos);
        }

        for deferred in self.deferred_adapters.drain(..) {
            let Some(&pos) = positions.get(&deferred.step) else {
                return config_error(format!(
                    "adapter attached to undeclared step `{}`",
                    deferred.step.name()
                ));
            };
            self.definitions[pos].persist = Some(deferred.adapter);
        }

        for definition in &self.definitions {
            if let Routing::Branch { targets, .. } = &definition.routing {
                if targets.is_empty() {
                    return config_error(format!(
                        "branch at `{}` declares no targets",
                        definition.id.name()
                    ));
                }
            }
            for target in definition.routing.targets() {
                let Some(&to) = index.get(&target) else {
                    return config_error(format!(
                        "step `{}` routes to undeclared step `{}`",
                        definition.id.name(),
                        target.name()
                    ));
                };
                graph.add_edge(index[&definition.id], to, ());
            }
        }

        if !self.definitions.iter().any(StepDefinition::is_terminal) {
            return config_error(format!("flow `{}` has no terminal step", self.flow_id));
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return config_error(format!("flow `{}` contains a cycle", self.flow_id));
        }

        let start = index[&self.definitions[0].id];
        let mut dfs = Dfs::new(&graph, start);
        let mut reached = 0;
        while dfs.next(&graph).is_some() {
            reached += 1;
        }
        if reached != self.definitions.len() {
            let unreachable: Vec<&str> = self
                .definitions
                .iter()
                .filter(|d| !dfs.discovered.is_visited(&index[&d.id]))
                .map(|d| d.id.name())
                .collect();
            return config_error(format!(
                "flow `{}` has unreachable steps: {}",
                self.flow_id,
                unreachable.join(", ")
            ));
        }

        Ok(StepGraph {
            flow_id: self.flow_id,
            graph,
            index,
            definitions: self.definitions,
            positions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    enum T {
        A,
        B,
        C,
        D,
    }

    impl StepKey for T {
        fn name(&self) -> &'static str {
            match self {
                T::A => "a",
                T::B => "b",
                T::C => "c",
                T::D => "d",
            }
        }
    }

    fn branching() -> StepGraph<T> {
        StepGraph::builder("test")
            .fixed(T::A, T::B)
            .branch(T::B, [T::C, T::D], |f: &FieldStore| {
                if f.flag("x") {
                    T::C
                } else {
                    T::D
                }
            })
            .fixed(T::C, T::D)
            .terminal(T::D)
            .build()
            .unwrap()
    }

    #[test]
    fn test_linear_flow() {
        let graph = StepGraph::builder("linear")
            .fixed(T::A, T::B)
            .terminal(T::B)
            .build()
            .unwrap();
        assert_eq!(graph.first_step(), T::A);
        assert_eq!(graph.step_count(), 2);
        assert_eq!(graph.next_step_of(T::A, &FieldStore::new()).unwrap(), Some(T::B));
        assert_eq!(graph.next_step_of(T::B, &FieldStore::new()).unwrap(), None);
        assert!(graph.is_terminal(T::B));
        assert!(!graph.has_step(T::C));
    }

    #[test]
    fn test_branch_uses_given_snapshot() {
        let graph = branching();
        let mut fields = FieldStore::new();
        assert_eq!(graph.next_step_of(T::B, &fields).unwrap(), Some(T::D));
        fields.update_field("x", json!(true));
        assert_eq!(graph.next_step_of(T::B, &fields).unwrap(), Some(T::C));
    }

    #[test]
    fn test_successors_and_predecessors() {
        let graph = branching();
        assert_eq!(graph.successors(T::B), vec![T::C, T::D]);
        assert_eq!(graph.predecessors(T::D), vec![T::B, T::C]);
        assert!(graph.successors(T::D).is_empty());
        assert_eq!(graph.terminal_steps(), vec![T::D]);
    }

    #[test]
    fn test_path_to_follows_branch() {
        let graph = branching();
        let mut fields = FieldStore::new();
        assert_eq!(graph.path_to(T::D, &fields), Some(vec![T::A, T::B, T::D]));
        assert_eq!(graph.path_to(T::C, &fields), None);
        fields.update_field("x", json!(true));
        assert_eq!(
            graph.path_to(T::D, &fields),
            Some(vec![T::A, T::B, T::C, T::D])
        );
        assert_eq!(graph.path_to(T::A, &fields), Some(vec![T::A]));
    }

    #[test]
    fn test_undeclared_branch_target_is_configuration_error() {
        let graph = StepGraph::builder("bad-branch")
            .branch(T::A, [T::B], |_: &FieldStore| T::C)
            .terminal(T::B)
            .terminal(T::C)
            .fixed(T::D, T::C)
            .build();
        // T::C and T::D are unreachable from A, so the build itself fails.
        assert!(matches!(graph, Err(StepwiseError::Configuration(_))));

        let graph = StepGraph::builder("bad-branch")
            .branch(T::A, [T::B, T::C], |_: &FieldStore| T::D)
            .terminal(T::B)
            .terminal(T::C)
            .build()
            .unwrap();
        assert!(matches!(
            graph.next_step_of(T::A, &FieldStore::new()),
            Err(StepwiseError::Configuration(_))
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let result = StepGraph::builder("cyclic")
            .fixed(T::A, T::B)
            .branch(T::B, [T::A, T::C], |_: &FieldStore| T::C)
            .terminal(T::C)
            .build();
        match result {
            Err(StepwiseError::Configuration(msg)) => assert!(msg.contains("cycle")),
            other => panic!("expected cycle error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_duplicate_step() {
        let result = StepGraph::builder("dup")
            .fixed(T::A, T::B)
            .fixed(T::A, T::B)
            .terminal(T::B)
            .build();
        assert!(matches!(result, Err(StepwiseError::Configuration(_))));
    }

    #[test]
    fn test_unknown_target() {
        let result = StepGraph::builder("unknown").fixed(T::A, T::B).terminal(T::C).build();
        assert!(matches!(result, Err(StepwiseError::Configuration(_))));
    }

    #[test]
    fn test_missing_terminal() {
        let result = StepGraph::<T>::builder("no-end")
            .fixed(T::A, T::B)
            .fixed(T::B, T::C)
            .fixed(T::C, T::D)
            .fixed(T::D, T::A)
            .build();
        assert!(matches!(result, Err(StepwiseError::Configuration(_))));
    }

    #[test]
    fn test_empty_flow() {
        let result = StepGraph::<T>::builder("empty").build();
        assert!(matches!(result, Err(StepwiseError::Configuration(_))));
    }

    #[test]
    fn test_unreachable_step() {
        let result = StepGraph::builder("island")
            .fixed(T::A, T::B)
            .terminal(T::B)
            .terminal(T::C)
            .build();
        match result {
            Err(StepwiseError::Configuration(msg)) => assert!(msg.contains("c")),
            other => panic!("expected unreachable error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_positions_follow_declaration_order() {
        let graph = branching();
        assert_eq!(graph.position_of(T::A), Some(0));
        assert_eq!(graph.position_of(T::D), Some(3));
        let steps: Vec<T> = graph.steps().collect();
        assert_eq!(steps, vec![T::A, T::B, T::C, T::D]);
    }

    #[test]
    fn test_graph_debug() {
        let debug_output = format!("{:?}", branching());
        assert!(debug_output.contains("StepGraph"));
        assert!(debug_output.contains("step_count"));
    }
}
