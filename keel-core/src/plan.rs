//! Plan - Ordered changes and the graph used to execute them
//!
//! A Plan is computed without side effects. It can be serialized for
//! preview and applied later, provided the state it was computed from has
//! not moved on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::ResourceAddress;
use crate::graph::DependencyGraph;
use crate::resource::{Attributes, Value};

/// What a change does to a resource instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    Update,
    Delete,
    Replace,
}

impl Action {
    /// Whether this action removes an existing object
    pub fn destroys(&self) -> bool {
        matches!(self, Action::Delete | Action::Replace)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::NoOp => "no-op",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Replace => "replace",
        };
        write!(f, "{}", s)
    }
}

/// Why a change was planned
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// An attribute that cannot change in place differs
    ForcesReplacement,
    /// The instance or declaration is tainted
    Tainted,
    /// The previous operation on the instance failed
    Errored,
    /// Tracked in state but no longer declared
    Orphaned,
    /// Part of a full destroy
    Destroy,
    /// Refresh found the object gone
    Disappeared,
    /// A deposed object from an earlier replace still exists
    DeposedObject,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeReason::ForcesReplacement => "forces replacement",
            ChangeReason::Tainted => "tainted",
            ChangeReason::Errored => "previous apply failed",
            ChangeReason::Orphaned => "no longer in configuration",
            ChangeReason::Destroy => "destroy",
            ChangeReason::Disappeared => "deleted outside of Keel",
            ChangeReason::DeposedObject => "deposed object",
        };
        write!(f, "{}", s)
    }
}

/// Difference of a single attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDiff {
    pub name: String,
    /// `None` when the attribute is absent
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub forces_replacement: bool,
}

/// Planned change to one resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub address: ResourceAddress,
    pub action: Action,
    pub provider: String,
    pub schema_version: u64,
    /// Attributes currently recorded (absent for Create)
    pub before: Option<Attributes>,
    /// Planned attributes; unresolved references are filled in during apply
    pub after: Option<Attributes>,
    pub diffs: Vec<AttributeDiff>,
    pub reasons: Vec<ChangeReason>,
    pub create_before_destroy: bool,
    pub prevent_destroy: bool,
    /// Dependencies recorded with the instance once applied
    pub dependencies: Vec<ResourceAddress>,
    /// Deposed objects this change deletes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<Attributes>,
}

impl Change {
    pub fn has_reason(&self, reason: ChangeReason) -> bool {
        self.reasons.contains(&reason)
    }

    /// Steps the executor runs for this change
    ///
    /// For Delete and Replace the steps must run in the returned order; the
    /// steps of other actions are independent of each other.
    pub fn steps(&self) -> Vec<Step> {
        let step = |kind| Step::new(self.address.clone(), kind);
        let cleanup = !self.deposed.is_empty()
            || (self.action == Action::Replace && self.create_before_destroy);
        let mut steps = Vec::new();

        match self.action {
            Action::NoOp => {}
            Action::Create => steps.push(step(StepKind::Create)),
            Action::Update => steps.push(step(StepKind::Update)),
            Action::Delete => {
                if cleanup {
                    steps.push(step(StepKind::DeleteDeposed));
                }
                steps.push(step(StepKind::Delete));
                return steps;
            }
            Action::Replace if self.create_before_destroy => steps.push(step(StepKind::Create)),
            Action::Replace => {
                if cleanup {
                    steps.push(step(StepKind::DeleteDeposed));
                }
                steps.push(step(StepKind::Delete));
                steps.push(step(StepKind::Create));
                return steps;
            }
        }

        if cleanup {
            steps.push(step(StepKind::DeleteDeposed));
        }
        steps
    }

    /// Whether the steps of this change are chained in order
    pub fn steps_are_ordered(&self) -> bool {
        self.action.destroys()
    }
}

/// Kind of provider operation a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Create,
    Update,
    Delete,
    /// Delete the old object of a create-before-destroy replace
    DeleteDeposed,
}

/// Unit of work the executor schedules
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Step {
    pub address: ResourceAddress,
    pub kind: StepKind,
}

impl Step {
    pub fn new(address: ResourceAddress, kind: StepKind) -> Self {
        Self { address, kind }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, StepKind::Delete | StepKind::DeleteDeposed)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StepKind::Create => write!(f, "Create {}", self.address),
            StepKind::Update => write!(f, "Update {}", self.address),
            StepKind::Delete => write!(f, "Delete {}", self.address),
            StepKind::DeleteDeposed => write!(f, "Delete {} (deposed)", self.address),
        }
    }
}

/// Change to an output value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChange {
    pub name: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Plan containing the changes to be executed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Changes in execution order
    pub(crate) changes: Vec<Change>,
    /// Dependency graph between resource instances (reversed for destroys)
    pub(crate) graph: DependencyGraph<ResourceAddress>,
    /// Graph of steps the executor walks
    pub(crate) steps: DependencyGraph<Step>,
    pub(crate) output_changes: Vec<OutputChange>,
    /// Undeclared instances whose objects were deleted outside of Keel; their
    /// records are dropped without calling a provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) forgotten: Vec<ResourceAddress>,
    /// Output expressions, re-evaluated after apply
    pub(crate) outputs: BTreeMap<String, Value>,
    pub(crate) destroy: bool,
    /// Lineage of the snapshot this plan was computed from
    pub(crate) lineage: Option<String>,
    /// Serial of that snapshot
    pub(crate) serial: Option<u64>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn change(&self, address: &ResourceAddress) -> Option<&Change> {
        self.changes.iter().find(|c| &c.address == address)
    }

    pub fn graph(&self) -> &DependencyGraph<ResourceAddress> {
        &self.graph
    }

    pub fn step_graph(&self) -> &DependencyGraph<Step> {
        &self.steps
    }

    /// Steps in a valid execution order
    pub fn ordered_steps(&self) -> Vec<Step> {
        self.steps
            .topological_order()
            .unwrap_or_else(|_| self.steps.nodes().cloned().collect())
    }

    pub fn output_changes(&self) -> &[OutputChange] {
        &self.output_changes
    }

    pub fn forgotten(&self) -> &[ResourceAddress] {
        &self.forgotten
    }

    pub fn outputs(&self) -> &BTreeMap<String, Value> {
        &self.outputs
    }

    pub fn is_destroy(&self) -> bool {
        self.destroy
    }

    pub fn lineage(&self) -> Option<&str> {
        self.lineage.as_deref()
    }

    pub fn serial(&self) -> Option<u64> {
        self.serial
    }

    /// True when applying would change nothing
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.output_changes.is_empty() && self.forgotten.is_empty()
    }

    /// Number of changes that call a provider
    pub fn mutation_count(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| c.action != Action::NoOp || !c.deposed.is_empty())
            .count()
    }

    /// Generate a summary of the Plan for display
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                Action::Create => summary.create += 1,
                Action::Update => summary.update += 1,
                Action::Delete => summary.delete += 1,
                Action::Replace => summary.replace += 1,
                Action::NoOp => {}
            }
        }
        summary
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub replace: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to delete",
            self.create, self.update, self.replace, self.delete
        )
    }
}

/// Format a change briefly for display
pub fn format_change_brief(change: &Change) -> String {
    let symbol = match change.action {
        Action::Create => "+",
        Action::Update => "~",
        Action::Delete => "-",
        Action::Replace if change.create_before_destroy => "+/-",
        Action::Replace => "-/+",
        Action::NoOp => " ",
    };
    format!("{} {}", symbol, change.address)
}
