//! Session progress reporting.
//!
//! This module provides [`FlowProgress`] for showing where a session is in
//! its flow. Display positions are derived here from the traversed path
//! and the projected route; they never drive routing.

use std::fmt;

use crate::{FieldStore, StepGraph, StepKey};

/// Display status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Traversed on the way to the current step.
    Complete,
    /// The active step.
    Current,
    /// Ahead on the route the current fields select.
    Upcoming,
    /// Not on the route the current fields select.
    Skipped,
}

/// Progress entry for a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgressEntry {
    /// The step name.
    pub name: &'static str,
    /// 1-based position on the route; `None` for skipped steps.
    pub position: Option<usize>,
    /// Display status.
    pub status: StepStatus,
}

impl StepProgressEntry {
    /// Returns a status indicator character.
    pub fn status_char(&self) -> char {
        match self.status {
            StepStatus::Complete => '✅',
            StepStatus::Current => '🔄',
            StepStatus::Upcoming => '⏳',
            StepStatus::Skipped => '⏭',
        }
    }
}

/// A snapshot of a session's position in its flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowProgress {
    /// The flow identifier.
    pub flow_id: String,
    /// One entry per declared step, in declaration order.
    pub steps: Vec<StepProgressEntry>,
}

impl FlowProgress {
    /// Computes progress from the traversed `history` (excluding
    /// `current`) and the route `fields` currently select.
    pub fn compute<S: StepKey>(
        graph: &StepGraph<S>,
        history: &[S],
        current: S,
        fields: &FieldStore,
    ) -> Self {
        let mut route: Vec<S> = history.to_vec();
        route.push(current);
        let mut cursor = current;
        while let Ok(Some(next)) = graph.next_step_of(cursor, fields) {
            if route.contains(&next) {
                break;
            }
            route.push(next);
            cursor = next;
        }

        let steps = graph
            .steps()
            .map(|step| {
                let position = route.iter().position(|s| *s == step).map(|i| i + 1);
                let status = if step == current {
                    StepStatus::Current
                } else if history.contains(&step) {
                    StepStatus::Complete
                } else if position.is_some() {
                    StepStatus::Upcoming
                } else {
                    StepStatus::Skipped
                };
                StepProgressEntry {
                    name: step.name(),
                    position,
                    status,
                }
            })
            .collect();

        Self {
            flow_id: graph.flow_id().to_string(),
            steps,
        }
    }

    /// Returns the current step's entry.
    pub fn current(&self) -> Option<&StepProgressEntry> {
        self.steps
            .iter()
            .find(|s| matches!(s.status, StepStatus::Current))
    }

    /// Returns the number of steps on the selected route.
    pub fn route_len(&self) -> usize {
        self.steps.iter().filter(|s| s.position.is_some()).count()
    }

    /// Returns the names of steps the selected route skips.
    pub fn skipped_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Skipped))
            .map(|s| s.name)
            .collect()
    }

    /// Returns the share of the route already completed, as a percentage.
    pub fn progress_percent(&self) -> f32 {
        let total = self.route_len();
        if total == 0 {
            return 100.0;
        }
        let completed = self
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Complete))
            .count();
        (completed as f32 / total as f32) * 100.0
    }
}

impl fmt::Display for FlowProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Progress for flow \"{}\":", self.flow_id)?;
        writeln!(f)?;

        for step in &self.steps {
            let position = step
                .position
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "  {} {:>2} {:<24} {:?}",
                step.status_char(),
                position,
                step.name,
                step.status
            )?;
        }

        writeln!(f)?;
        match self.current() {
            Some(current) => writeln!(
                f,
                "Step {} of {} ({:.0}%)",
                current.position.unwrap_or(0),
                self.route_len(),
                self.progress_percent()
            ),
            None => writeln!(f, "No active step"),
        }
    }
}
