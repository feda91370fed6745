//! Differ - Compare desired declarations with recorded state to generate a Plan
//!
//! Planning has no side effects. The decision for every address follows the
//! dependency order, so references to resources that will not change resolve
//! to their recorded values while references to resources that will change
//! stay as placeholders until apply.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::ResourceAddress;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::graph::{build_graph, format_cycle, DependencyGraph};
use crate::plan::{Action, AttributeDiff, Change, ChangeReason, OutputChange, Plan, Step, StepKind};
use crate::provider::{Diagnostic, ProviderRegistry};
use crate::refresh::RefreshResult;
use crate::resource::{Attributes, Configuration, Reference, ResourceDeclaration, Value};
use crate::schema::ResourceSchema;
use crate::snapshot::{ResourceInstanceState, StateSnapshot};

/// Inputs of a planning run
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub config: &'a Configuration,
    /// Snapshot read from the store; `None` before the first apply
    pub prior: Option<&'a StateSnapshot>,
    /// Real-world view of `prior`, when a refresh ran first
    pub refreshed: Option<&'a RefreshResult>,
    /// Plan the deletion of every tracked instance
    pub destroy: bool,
}

impl<'a> PlanRequest<'a> {
    pub fn new(config: &'a Configuration) -> Self {
        Self {
            config,
            prior: None,
            refreshed: None,
            destroy: false,
        }
    }

    pub fn with_prior(mut self, prior: Option<&'a StateSnapshot>) -> Self {
        self.prior = prior;
        self
    }

    pub fn with_refresh(mut self, refreshed: Option<&'a RefreshResult>) -> Self {
        self.refreshed = refreshed;
        self
    }

    pub fn destroy(mut self, destroy: bool) -> Self {
        self.destroy = destroy;
        self
    }
}

/// Planned values of every address, used to resolve references
type PlannedValues = BTreeMap<ResourceAddress, (Action, Attributes)>;

/// Compute the Plan converging recorded state to the configuration
pub fn create_plan(request: PlanRequest<'_>, providers: &ProviderRegistry) -> EngineResult<Plan> {
    let empty = StateSnapshot::with_lineage(String::new());
    let prior = request.prior.unwrap_or(&empty);
    let current = request.refreshed.map_or(prior, |r| &r.snapshot);
    let disappeared: BTreeSet<&ResourceAddress> = request
        .refreshed
        .map(|r| r.disappeared.iter().collect())
        .unwrap_or_default();

    let declarations: &[ResourceDeclaration] = if request.destroy {
        &[]
    } else {
        &request.config.resources
    };

    let mut targets = BTreeMap::new();
    for decl in declarations {
        targets.insert(&decl.address, resolve_target(decl, providers)?);
    }

    // Orphans come from the stored snapshot so disappeared ones are forgotten too
    let graph = build_graph(declarations, prior)?;
    let order = graph
        .topological_order()
        .map_err(|cycle| ConfigError::Cycle {
            path: format_cycle(&cycle),
        })?;

    let mut planned = PlannedValues::new();
    let mut changes: BTreeMap<ResourceAddress, Change> = BTreeMap::new();
    let mut forgotten = Vec::new();

    for address in &order {
        let change = match targets.get(address) {
            Some(target) => {
                let instance = current.get(address).filter(|_| !disappeared.contains(address));
                plan_declared(target, instance, prior, &graph, &planned, disappeared.contains(address))
            }
            None => match prior.get(address) {
                // Nothing left to delete; the record is dropped at apply
                Some(instance) if disappeared.contains(address) => {
                    forgotten.push(address.clone());
                    if instance.deposed.is_empty() {
                        continue;
                    }
                    plan_deposed_cleanup(instance)
                }
                Some(instance) => plan_removal(instance, request.destroy),
                None => continue,
            },
        };
        log::debug!("{}: {}", change.address, change.action);
        planned.insert(
            address.clone(),
            (change.action, change.after.clone().unwrap_or_default()),
        );
        changes.insert(address.clone(), change);
    }

    let protected: Vec<ResourceAddress> = changes
        .values()
        .filter(|c| c.action.destroys() && c.prevent_destroy)
        .map(|c| c.address.clone())
        .collect();
    if !protected.is_empty() {
        return Err(EngineError::PreventDestroy {
            addresses: protected,
        });
    }

    propagate_create_before_destroy(&order, &graph, &mut changes);

    let steps = build_step_graph(&graph, &changes)?;
    let step_order = steps.topological_order().map_err(|cycle| ConfigError::Cycle {
        path: format_cycle(&cycle),
    })?;
    let mut position: BTreeMap<&ResourceAddress, usize> = BTreeMap::new();
    for (i, step) in step_order.iter().enumerate() {
        position.entry(&step.address).or_insert(i);
    }

    let mut ordered: Vec<Change> = changes
        .values()
        .filter(|c| c.action != Action::NoOp || !c.deposed.is_empty())
        .cloned()
        .collect();
    ordered.sort_by_key(|c| position.get(&c.address).copied().unwrap_or(usize::MAX));

    let outputs = if request.destroy {
        BTreeMap::new()
    } else {
        request.config.outputs.clone()
    };
    let output_changes = plan_outputs(&outputs, prior, &planned);

    let plan = Plan {
        changes: ordered,
        graph: if request.destroy { graph.reversed() } else { graph },
        steps,
        output_changes,
        forgotten,
        outputs,
        destroy: request.destroy,
        lineage: request.prior.map(|p| p.lineage.clone()),
        serial: request.prior.map(|p| p.serial),
    };

    log::info!("{}", plan.summary());
    Ok(plan)
}

/// A declaration together with what its provider says about it
struct Target<'a> {
    decl: &'a ResourceDeclaration,
    provider: String,
    schema: Option<ResourceSchema>,
}

fn resolve_target<'a>(
    decl: &'a ResourceDeclaration,
    providers: &ProviderRegistry,
) -> Result<Target<'a>, ConfigError> {
    let adapter =
        providers
            .get(&decl.address.resource_type)
            .ok_or_else(|| ConfigError::UnknownResourceType {
                address: decl.address.clone(),
                resource_type: decl.address.resource_type.clone(),
            })?;

    let (errors, warnings): (Vec<Diagnostic>, Vec<Diagnostic>) = adapter
        .validate(&decl.address, &decl.attributes)
        .into_iter()
        .partition(Diagnostic::is_error);
    for warning in &warnings {
        log::warn!("{}: {}", decl.address, warning);
    }
    if !errors.is_empty() {
        return Err(ConfigError::Validation {
            address: decl.address.clone(),
            diagnostics: errors,
        });
    }

    let schema = adapter.schema(&decl.address.resource_type);
    check_lifecycle(decl, schema.as_ref())?;

    Ok(Target {
        decl,
        provider: decl
            .provider
            .clone()
            .unwrap_or_else(|| adapter.name().to_string()),
        schema,
    })
}

fn check_lifecycle(
    decl: &ResourceDeclaration,
    schema: Option<&ResourceSchema>,
) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for name in &decl.lifecycle.ignore_changes {
        if !seen.insert(name) {
            return Err(ConfigError::InvalidLifecycle {
                address: decl.address.clone(),
                reason: format!("'{}' is listed twice in ignore_changes", name),
            });
        }
        let known =
            decl.attributes.contains_key(name) || schema.is_none_or(|s| s.get(name).is_some());
        if !known {
            return Err(ConfigError::InvalidLifecycle {
                address: decl.address.clone(),
                reason: format!("ignore_changes names unknown attribute '{}'", name),
            });
        }
    }
    Ok(())
}

/// Value of a referenced attribute as far as it is known at plan time
fn planned_value(planned: &PlannedValues, reference: &Reference) -> Option<Value> {
    let (action, attributes) = planned.get(&reference.address)?;
    match attributes.get(&reference.attribute) {
        Some(value) if value.is_known() => Some(value.clone()),
        None if *action == Action::NoOp => Some(Value::Null),
        _ => None,
    }
}

fn plan_declared(
    target: &Target<'_>,
    instance: Option<&ResourceInstanceState>,
    prior: &StateSnapshot,
    graph: &DependencyGraph<ResourceAddress>,
    planned: &PlannedValues,
    disappeared: bool,
) -> Change {
    let decl = target.decl;
    let schema = target.schema.as_ref();
    let lookup = |r: &Reference| planned_value(planned, r);

    let mut desired: Attributes = decl
        .attributes
        .iter()
        .map(|(name, value)| (name.clone(), value.resolve(&lookup)))
        .collect();

    if let Some(instance) = instance {
        for name in &decl.lifecycle.ignore_changes {
            match instance.attributes.get(name) {
                Some(value) => desired.insert(name.clone(), value.clone()),
                None => desired.remove(name),
            };
        }
    }

    let mut reasons = Vec::new();
    let (action, before, after, diffs) = match instance {
        None => {
            if disappeared {
                reasons.push(ChangeReason::Disappeared);
            }
            let after = with_unknown_computed(desired, schema);
            let diffs = diff_attributes(&Attributes::new(), &after, schema);
            (Action::Create, None, after, diffs)
        }
        Some(instance) => {
            let diffs = diff_attributes(&instance.attributes, &desired, schema);
            if instance.tainted || decl.tainted {
                reasons.push(ChangeReason::Tainted);
            }
            if diffs.iter().any(|d| d.forces_replacement) {
                reasons.push(ChangeReason::ForcesReplacement);
            }
            if instance.is_errored() {
                reasons.push(ChangeReason::Errored);
            }

            let action = if reasons
                .iter()
                .any(|r| matches!(r, ChangeReason::Tainted | ChangeReason::ForcesReplacement))
            {
                Action::Replace
            } else if !diffs.is_empty() || instance.is_errored() {
                Action::Update
            } else {
                Action::NoOp
            };

            let after = match action {
                Action::Replace => with_unknown_computed(desired, schema),
                Action::Update => {
                    let mut merged = instance.attributes.clone();
                    for diff in diffs.iter().filter(|d| d.after.is_none()) {
                        merged.remove(&diff.name);
                    }
                    merged.extend(desired);
                    merged
                }
                _ => instance.attributes.clone(),
            };
            (action, Some(instance.attributes.clone()), after, diffs)
        }
    };

    let deposed = prior
        .get(&decl.address)
        .map(|i| i.deposed.clone())
        .unwrap_or_default();
    if !deposed.is_empty() {
        reasons.push(ChangeReason::DeposedObject);
    }

    Change {
        address: decl.address.clone(),
        action,
        provider: target.provider.clone(),
        schema_version: schema.map_or(0, |s| s.version),
        before,
        after: Some(after),
        diffs,
        reasons,
        create_before_destroy: decl.lifecycle.create_before_destroy,
        prevent_destroy: decl.lifecycle.prevent_destroy,
        dependencies: graph.dependencies_of(&decl.address).cloned().collect(),
        deposed,
    }
}

/// Delete of an instance that is no longer declared, or of every instance on destroy
fn plan_removal(instance: &ResourceInstanceState, destroy: bool) -> Change {
    Change {
        address: instance.address.clone(),
        action: Action::Delete,
        provider: instance.provider.clone(),
        schema_version: instance.schema_version,
        before: Some(instance.attributes.clone()),
        after: None,
        diffs: instance
            .attributes
            .iter()
            .map(|(name, value)| AttributeDiff {
                name: name.clone(),
                before: Some(value.clone()),
                after: None,
                forces_replacement: false,
            })
            .collect(),
        reasons: vec![if destroy {
            ChangeReason::Destroy
        } else {
            ChangeReason::Orphaned
        }],
        create_before_destroy: false,
        prevent_destroy: instance.prevent_destroy,
        dependencies: instance.dependencies.clone(),
        deposed: instance.deposed.clone(),
    }
}

/// Cleanup of the deposed objects of a record whose current object is gone
fn plan_deposed_cleanup(instance: &ResourceInstanceState) -> Change {
    Change {
        address: instance.address.clone(),
        action: Action::NoOp,
        provider: instance.provider.clone(),
        schema_version: instance.schema_version,
        before: Some(instance.attributes.clone()),
        after: None,
        diffs: Vec::new(),
        reasons: vec![ChangeReason::Disappeared, ChangeReason::DeposedObject],
        create_before_destroy: false,
        prevent_destroy: instance.prevent_destroy,
        dependencies: instance.dependencies.clone(),
        deposed: instance.deposed.clone(),
    }
}

/// Computed attributes left out of the configuration are unknown until apply
fn with_unknown_computed(mut attributes: Attributes, schema: Option<&ResourceSchema>) -> Attributes {
    if let Some(schema) = schema {
        for (name, attr) in &schema.attributes {
            if attr.computed && !attributes.contains_key(name) {
                attributes.insert(name.clone(), Value::Unknown);
            }
        }
    }
    attributes
}

fn diff_attributes(
    before: &Attributes,
    after: &Attributes,
    schema: Option<&ResourceSchema>,
) -> Vec<AttributeDiff> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    let mut diffs = Vec::new();

    for name in names {
        let old = before.get(name);
        let new = after.get(name);
        let changed = match (old, new) {
            (Some(a), Some(b)) => !schema.map_or(a == b, |s| s.values_equal(name, a, b)),
            (None, Some(_)) => true,
            // Computed attributes the configuration leaves unset belong to the provider
            (Some(_), None) => !schema.is_some_and(|s| s.is_computed(name)),
            (None, None) => false,
        };
        if changed {
            diffs.push(AttributeDiff {
                name: name.clone(),
                before: old.cloned(),
                after: new.cloned(),
                forces_replacement: schema.is_some_and(|s| s.forces_replacement(name)),
            });
        }
    }
    diffs
}

/// A replaced dependency of a create-before-destroy resource must also be
/// created before it is destroyed, or the step graph would contain a cycle
fn propagate_create_before_destroy(
    order: &[ResourceAddress],
    graph: &DependencyGraph<ResourceAddress>,
    changes: &mut BTreeMap<ResourceAddress, Change>,
) {
    for address in order.iter().rev() {
        let propagates = changes
            .get(address)
            .is_some_and(|c| c.action == Action::Replace && c.create_before_destroy);
        if !propagates {
            continue;
        }
        for dependency in graph.dependencies_of(address) {
            let Some(change) = changes.get_mut(dependency) else {
                continue;
            };
            if change.action == Action::Replace && !change.create_before_destroy {
                log::debug!(
                    "{} is replaced create-before-destroy because {} is",
                    dependency,
                    address
                );
                change.create_before_destroy = true;
            }
        }
    }
}

fn apply_step(change: &Change) -> Option<Step> {
    change
        .steps()
        .into_iter()
        .find(|s| matches!(s.kind, StepKind::Create | StepKind::Update))
}

fn delete_steps(change: &Change) -> Vec<Step> {
    change.steps().into_iter().filter(Step::is_delete).collect()
}

/// Closest addresses in one direction that satisfy `has_step`, walking
/// through addresses that do not
fn nearest(
    graph: &DependencyGraph<ResourceAddress>,
    start: &ResourceAddress,
    upstream: bool,
    has_step: impl Fn(&ResourceAddress) -> bool,
) -> BTreeSet<ResourceAddress> {
    let neighbors = |node: &ResourceAddress| -> Vec<ResourceAddress> {
        if upstream {
            graph.dependencies_of(node).cloned().collect()
        } else {
            graph.dependents_of(node).cloned().collect()
        }
    };

    let mut found = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut stack = neighbors(start);
    while let Some(node) = stack.pop() {
        if !seen.insert(node.clone()) {
            continue;
        }
        if has_step(&node) {
            found.insert(node);
        } else {
            stack.extend(neighbors(&node));
        }
    }
    found
}

/// Derive the graph of provider operations from the address graph
fn build_step_graph(
    graph: &DependencyGraph<ResourceAddress>,
    changes: &BTreeMap<ResourceAddress, Change>,
) -> Result<DependencyGraph<Step>, ConfigError> {
    let mut steps = DependencyGraph::new();

    for change in changes.values() {
        let own = change.steps();
        for step in &own {
            steps.add_node(step.clone());
        }
        if change.steps_are_ordered() {
            for pair in own.windows(2) {
                steps.add_edge(pair[0].clone(), pair[1].clone());
            }
        }
    }

    let apply_of = |address: &ResourceAddress| changes.get(address).and_then(apply_step);
    let deletes_of = |address: &ResourceAddress| {
        changes
            .get(address)
            .map(delete_steps)
            .unwrap_or_default()
    };

    for (address, change) in changes {
        // Create/Update of a dependent waits for Create/Update of its dependencies
        if let Some(apply) = apply_step(change) {
            for dependency in nearest(graph, address, true, |a| apply_of(a).is_some()) {
                if let Some(before) = apply_of(&dependency) {
                    steps.add_edge(before, apply.clone());
                }
            }
        }

        // Dependents are deleted before what they depend on
        let deletes = delete_steps(change);
        if !deletes.is_empty() {
            for dependent in nearest(graph, address, false, |a| !deletes_of(a).is_empty()) {
                for first in deletes_of(&dependent) {
                    for then in &deletes {
                        steps.add_edge(first.clone(), then.clone());
                    }
                }
            }
        }

        // Old objects go once dependents moved on, including objects left
        // deposed by an earlier run
        let deletes_old_after_dependents = match change.action {
            Action::Replace => change.create_before_destroy,
            Action::Delete => false,
            _ => !change.deposed.is_empty(),
        };
        if deletes_old_after_dependents {
            let old = Step::new(address.clone(), StepKind::DeleteDeposed);
            for dependent in nearest(graph, address, false, |a| apply_of(a).is_some()) {
                if let Some(moved) = apply_of(&dependent) {
                    steps.add_edge(moved, old.clone());
                }
            }
        }
    }

    if let Some(cycle) = steps.find_cycle() {
        return Err(ConfigError::Cycle {
            path: format_cycle(&cycle),
        });
    }
    Ok(steps)
}

fn plan_outputs(
    outputs: &BTreeMap<String, Value>,
    prior: &StateSnapshot,
    planned: &PlannedValues,
) -> Vec<OutputChange> {
    let lookup = |r: &Reference| planned_value(planned, r);
    let names: BTreeSet<&String> = outputs.keys().chain(prior.outputs.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let before = prior.outputs.get(name).cloned();
            let after = outputs.get(name).map(|expr| expr.resolve(&lookup));
            (before != after).then(|| OutputChange {
                name: name.clone(),
                before,
                after,
            })
        })
        .collect()
}
