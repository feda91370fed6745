//! Executor - Walk the step graph of a Plan and apply it through providers
//!
//! Provider calls run on a bounded set of tasks. Everything else (graph
//! bookkeeping, snapshot merging, store writes) happens in the scheduling
//! loop, so the snapshot has a single writer. Each completed step is written
//! to the store immediately, making every intermediate state recoverable.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::address::ResourceAddress;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::plan::{Action, Change, ChangeReason, Plan, Step, StepKind};
use crate::provider::{OperationContext, ProviderAdapter, ProviderError, ProviderRegistry, ProviderResult};
use crate::resource::{Attributes, Reference, Value};
use crate::retry::RetryPolicy;
use crate::snapshot::{InstanceStatus, ResourceInstanceState, StateSnapshot};
use crate::store::{StateStore, StoreError, StoreResult};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of provider calls in flight
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// Time budget handed to the adapter for each call
    pub change_timeout: Option<Duration>,
    /// No step is started once this much time has passed
    pub deadline: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            retry: RetryPolicy::default(),
            change_timeout: None,
            deadline: None,
        }
    }
}

/// Cooperative cancellation of a run
///
/// Cancelling stops new steps from starting; calls already in flight finish
/// and their results are recorded.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A step whose provider call failed
#[derive(Debug)]
pub struct StepFailure {
    pub step: Step,
    pub error: ProviderError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Outcome of executing a Plan
#[derive(Debug)]
pub struct ApplyReport {
    pub applied: Vec<Step>,
    pub errored: Vec<StepFailure>,
    /// Steps that depend on a failed step
    pub skipped: Vec<Step>,
    /// Steps left alone because the run was cancelled or ran out of time
    pub not_started: Vec<Step>,
    /// Snapshot after the run, as last written
    pub snapshot: StateSnapshot,
}

impl ApplyReport {
    fn new(snapshot: StateSnapshot) -> Self {
        Self {
            applied: Vec::new(),
            errored: Vec::new(),
            skipped: Vec::new(),
            not_started: Vec::new(),
            snapshot,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errored.is_empty() && self.not_started.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} applied, {} failed, {} skipped, {} not started",
            self.applied.len(),
            self.errored.len(),
            self.skipped.len(),
            self.not_started.len()
        );
        for failure in &self.errored {
            summary.push_str(&format!("\n  {}", failure));
        }
        summary
    }
}

/// Provider work prepared by the scheduling loop for one step
enum Operation {
    Create(Attributes),
    Update { prior: Attributes, desired: Attributes },
    Delete(Attributes),
    DeleteDeposed(Vec<Attributes>),
}

struct StepOutput {
    step: Step,
    result: ProviderResult<Option<Attributes>>,
    /// Deposed objects removed before any failure
    deposed_deleted: usize,
}

/// Mutable bookkeeping of one run
struct Run {
    snapshot: StateSnapshot,
    read_serial: Option<u64>,
    report: ApplyReport,
    in_degree: BTreeMap<Step, usize>,
    ready: BTreeSet<Step>,
    store_error: Option<StoreError>,
}

/// Executes Plans against providers and a State Store
pub struct Executor<'a> {
    providers: &'a ProviderRegistry,
    store: &'a dyn StateStore,
    key: &'a str,
    config: ExecutorConfig,
    cancel: CancelHandle,
}

impl<'a> Executor<'a> {
    pub fn new(providers: &'a ProviderRegistry, store: &'a dyn StateStore, key: &'a str) -> Self {
        Self {
            providers,
            store,
            key,
            config: ExecutorConfig::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute a Plan
    ///
    /// The stored snapshot must still be the one the plan was computed from.
    /// Returns the report on full success, `PartialApply` when a step failed
    /// and `Interrupted` when steps were left unstarted.
    pub async fn execute(&self, plan: &Plan) -> EngineResult<ApplyReport> {
        let (snapshot, read_serial) = self.load(plan).await?;

        let changes: BTreeMap<&ResourceAddress, &Change> =
            plan.changes().iter().map(|c| (&c.address, c)).collect();
        let mut adapters: BTreeMap<&ResourceAddress, Arc<dyn ProviderAdapter>> = BTreeMap::new();
        for change in plan.changes() {
            let adapter = self
                .providers
                .get(&change.address.resource_type)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownResourceType {
                    address: change.address.clone(),
                    resource_type: change.address.resource_type.clone(),
                })?;
            adapters.insert(&change.address, adapter);
        }

        let graph = plan.step_graph();
        let in_degree: BTreeMap<Step, usize> = graph
            .nodes()
            .map(|s| (s.clone(), graph.dependencies_of(s).count()))
            .collect();
        let ready = in_degree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(s, _)| s.clone())
            .collect();

        let mut run = Run {
            snapshot: snapshot.clone(),
            read_serial,
            report: ApplyReport::new(snapshot),
            in_degree,
            ready,
            store_error: None,
        };

        log::info!("Applying {} steps", graph.len());
        self.forget(plan, &mut run).await;

        // A deadline too far out to represent is no deadline
        let deadline = self
            .config
            .deadline
            .and_then(|d| Instant::now().checked_add(d));
        let parallelism = self.config.parallelism.max(1);
        let mut tasks: JoinSet<StepOutput> = JoinSet::new();
        let mut halted = false;

        loop {
            if !halted {
                if run.store_error.is_some() {
                    halted = true;
                } else if self.cancel.is_cancelled() {
                    log::warn!("Apply cancelled, waiting for {} running steps", tasks.len());
                    halted = true;
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    log::warn!("Deadline reached, waiting for {} running steps", tasks.len());
                    halted = true;
                }
            }

            while !halted && tasks.len() < parallelism {
                let Some(step) = run.ready.pop_first() else {
                    break;
                };
                let (Some(change), Some(adapter)) =
                    (changes.get(&step.address), adapters.get(&step.address))
                else {
                    continue;
                };

                match prepare(&step, change, &run.snapshot) {
                    Ok(operation) => {
                        log::debug!("{}: started", step);
                        let ctx = OperationContext::new(step.address.clone())
                            .with_timeout(self.config.change_timeout);
                        tasks.spawn(run_step(
                            step,
                            adapter.clone(),
                            ctx,
                            operation,
                            self.config.retry.clone(),
                        ));
                    }
                    Err(error) => {
                        let output = StepOutput {
                            step,
                            result: Err(error),
                            deposed_deleted: 0,
                        };
                        self.finish(plan, change, output, &mut run).await;
                        halted = run.store_error.is_some();
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(output) => {
                    if let Some(change) = changes.get(&output.step.address) {
                        self.finish(plan, change, output, &mut run).await;
                    }
                }
                Err(e) => log::error!("Step task failed: {}", e),
            }
        }

        if run.store_error.is_none() {
            let outputs = evaluate_outputs(plan.outputs(), &run.snapshot);
            if outputs != run.snapshot.outputs {
                run.snapshot.outputs = outputs;
                self.persist(&mut run).await;
            }
        }

        let done: BTreeSet<&Step> = run
            .report
            .applied
            .iter()
            .chain(run.report.errored.iter().map(|f| &f.step))
            .collect();
        let blocked: BTreeSet<Step> = run
            .report
            .errored
            .iter()
            .flat_map(|f| graph.transitive_dependents(&f.step))
            .collect();
        let (skipped, not_started): (Vec<Step>, Vec<Step>) = graph
            .nodes()
            .filter(|s| !done.contains(s))
            .cloned()
            .partition(|s| blocked.contains(s));

        let mut report = run.report;
        report.skipped = skipped;
        report.not_started = not_started;
        report.snapshot = run.snapshot;

        if let Some(e) = run.store_error {
            return Err(EngineError::Store(e));
        }
        log::info!("Apply finished: {}", report.summary());
        if !report.errored.is_empty() {
            Err(EngineError::PartialApply(Box::new(report)))
        } else if !report.not_started.is_empty() {
            Err(EngineError::Interrupted(Box::new(report)))
        } else {
            Ok(report)
        }
    }

    /// Read the stored snapshot and check the plan was computed from it
    async fn load(&self, plan: &Plan) -> StoreResult<(StateSnapshot, Option<u64>)> {
        let stored = self.store.get(self.key).await?;
        let stored_serial = stored.as_ref().map(|s| s.serial);
        if stored_serial != plan.serial() {
            return Err(StoreError::Conflict {
                expected: plan.serial(),
                actual: stored_serial,
            });
        }

        match stored {
            Some(snapshot) => {
                if plan.lineage() != Some(snapshot.lineage.as_str()) {
                    return Err(StoreError::LineageMismatch {
                        expected: snapshot.lineage,
                        actual: plan.lineage().unwrap_or_default().to_string(),
                    });
                }
                Ok((snapshot, stored_serial))
            }
            None => Ok((StateSnapshot::new(), None)),
        }
    }

    /// Record a finished step and persist the result
    async fn finish(&self, plan: &Plan, change: &Change, output: StepOutput, run: &mut Run) {
        let StepOutput {
            step,
            result,
            deposed_deleted,
        } = output;

        match result {
            Ok(attributes) => {
                log::info!("{}: done", step);
                record_success(&step, change, attributes, &mut run.snapshot);
                self.persist(run).await;

                for dependent in plan.step_graph().dependents_of(&step) {
                    if let Some(n) = run.in_degree.get_mut(dependent) {
                        *n = n.saturating_sub(1);
                        if *n == 0 {
                            run.ready.insert(dependent.clone());
                        }
                    }
                }
                run.report.applied.push(step);
            }
            Err(error) => {
                log::error!("{}: {}", step, error);
                if record_failure(&step, deposed_deleted, &mut run.snapshot) {
                    self.persist(run).await;
                }
                run.report.errored.push(StepFailure { step, error });
            }
        }
    }

    /// Drop records of undeclared objects deleted outside of Keel
    ///
    /// Records that still have deposed objects stay until their cleanup step.
    async fn forget(&self, plan: &Plan, run: &mut Run) {
        let mut changed = false;
        for address in plan.forgotten() {
            if run
                .snapshot
                .get(address)
                .is_some_and(|i| i.deposed.is_empty())
            {
                log::info!("{}: deleted outside of Keel, removing from state", address);
                run.snapshot.remove(address);
                changed = true;
            }
        }
        if changed {
            self.persist(run).await;
        }
    }

    /// Write the snapshot, keeping the first store error
    async fn persist(&self, run: &mut Run) {
        if run.store_error.is_some() {
            return;
        }
        run.snapshot.increment_serial();
        match self
            .store
            .write(self.key, &run.snapshot, run.read_serial)
            .await
        {
            Ok(()) => run.read_serial = Some(run.snapshot.serial),
            Err(e) => {
                log::error!("Failed to write state: {}", e);
                run.store_error = Some(e);
            }
        }
    }
}

/// Current value of a referenced attribute; missing attributes read as null
fn snapshot_value(snapshot: &StateSnapshot, reference: &Reference) -> Option<Value> {
    snapshot.get(&reference.address).map(|instance| {
        instance
            .attributes
            .get(&reference.attribute)
            .cloned()
            .unwrap_or(Value::Null)
    })
}

/// Resolve references and drop computed placeholders before calling a provider
fn resolve_config(planned: &Attributes, snapshot: &StateSnapshot) -> ProviderResult<Attributes> {
    let lookup = |r: &Reference| snapshot_value(snapshot, r);
    let mut resolved = Attributes::new();
    for (name, value) in planned {
        if *value == Value::Unknown {
            continue;
        }
        let value = value.resolve(&lookup);
        if !value.is_known() {
            return Err(ProviderError::new(format!(
                "attribute '{}' is still unknown: {}",
                name, value
            )));
        }
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn prepare(step: &Step, change: &Change, snapshot: &StateSnapshot) -> ProviderResult<Operation> {
    let recorded = snapshot.get(&step.address);
    let prior = || {
        recorded
            .map(|r| r.attributes.clone())
            .or_else(|| change.before.clone())
            .unwrap_or_default()
    };
    let planned = || {
        change.after.as_ref().ok_or_else(|| {
            ProviderError::new("change has no planned attributes").for_resource(step.address.clone())
        })
    };

    Ok(match step.kind {
        StepKind::Create => Operation::Create(
            resolve_config(planned()?, snapshot).map_err(|e| e.for_resource(step.address.clone()))?,
        ),
        StepKind::Update => Operation::Update {
            prior: prior(),
            desired: resolve_config(planned()?, snapshot)
                .map_err(|e| e.for_resource(step.address.clone()))?,
        },
        StepKind::Delete => Operation::Delete(prior()),
        StepKind::DeleteDeposed => {
            Operation::DeleteDeposed(recorded.map(|r| r.deposed.clone()).unwrap_or_default())
        }
    })
}

/// Provider side of a step, run on a worker task
async fn run_step(
    step: Step,
    adapter: Arc<dyn ProviderAdapter>,
    ctx: OperationContext,
    operation: Operation,
    retry: RetryPolicy,
) -> StepOutput {
    let address = step.address.clone();
    // A panicking adapter fails its own step only
    let worker = tokio::spawn(async move {
        let adapter = adapter.as_ref();
        let ctx = &ctx;
        match operation {
            Operation::Create(config) => {
                let result = retry
                    .run(&ctx.address, "create", || adapter.create(ctx, &config))
                    .await;
                (result.map(Some), 0)
            }
            Operation::Update { prior, desired } => {
                let result = retry
                    .run(&ctx.address, "update", || adapter.update(ctx, &prior, &desired))
                    .await;
                (result.map(Some), 0)
            }
            Operation::Delete(prior) => {
                let result = retry
                    .run(&ctx.address, "delete", || adapter.delete(ctx, &prior))
                    .await;
                (result.map(|()| None), 0)
            }
            Operation::DeleteDeposed(objects) => {
                let mut deleted = 0;
                for object in &objects {
                    if let Err(e) = retry
                        .run(&ctx.address, "delete deposed", || adapter.delete(ctx, object))
                        .await
                    {
                        return (Err(e), deleted);
                    }
                    deleted += 1;
                }
                (Ok(None), deleted)
            }
        }
    });

    let (result, deposed_deleted) = match worker.await {
        Ok(output) => output,
        Err(e) => (Err(ProviderError::new(format!("provider call panicked: {}", e))), 0),
    };
    let result = result.map_err(|e| {
        if e.address.is_none() {
            e.for_resource(address)
        } else {
            e
        }
    });

    StepOutput {
        step,
        result,
        deposed_deleted,
    }
}

fn record_success(
    step: &Step,
    change: &Change,
    attributes: Option<Attributes>,
    snapshot: &mut StateSnapshot,
) {
    match step.kind {
        StepKind::Create | StepKind::Update => {
            let existing = snapshot.get(&step.address);
            let mut deposed = existing.map(|e| e.deposed.clone()).unwrap_or_default();
            if step.kind == StepKind::Create
                && change.action == Action::Replace
                && change.create_before_destroy
            {
                deposed.extend(existing.map(|e| e.attributes.clone()));
            }

            snapshot.upsert(ResourceInstanceState {
                address: step.address.clone(),
                provider: change.provider.clone(),
                schema_version: change.schema_version,
                attributes: attributes.unwrap_or_default(),
                status: InstanceStatus::Managed,
                tainted: false,
                prevent_destroy: change.prevent_destroy,
                dependencies: change.dependencies.clone(),
                deposed,
            });
        }
        StepKind::Delete => {
            snapshot.remove(&step.address);
        }
        StepKind::DeleteDeposed => {
            if change.action == Action::NoOp && change.has_reason(ChangeReason::Disappeared) {
                snapshot.remove(&step.address);
            } else if let Some(instance) = snapshot.get_mut(&step.address) {
                instance.deposed.clear();
            }
        }
    }
}

/// Returns true if the snapshot changed
fn record_failure(step: &Step, deposed_deleted: usize, snapshot: &mut StateSnapshot) -> bool {
    let Some(instance) = snapshot.get_mut(&step.address) else {
        return false;
    };
    match step.kind {
        StepKind::DeleteDeposed => {
            let deleted = deposed_deleted.min(instance.deposed.len());
            instance.deposed.drain(..deleted);
            deleted > 0
        }
        _ => {
            let changed = instance.status != InstanceStatus::Errored;
            instance.status = InstanceStatus::Errored;
            changed
        }
    }
}

/// Output values that can be computed from the snapshot
pub fn evaluate_outputs(
    outputs: &BTreeMap<String, Value>,
    snapshot: &StateSnapshot,
) -> BTreeMap<String, Value> {
    let lookup = |r: &Reference| snapshot_value(snapshot, r);
    outputs
        .iter()
        .filter_map(|(name, expr)| {
            let value = expr.resolve(&lookup);
            value.is_known().then(|| (name.clone(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::{PlanRequest, create_plan};
    use crate::resource::{Configuration, Lifecycle};
    use crate::store::MemoryStore;
    use crate::testing::{TestProvider, addr, node};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    const KEY: &str = "default";

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(1), Duration::from_millis(2)),
            ..ExecutorConfig::default()
        }
    }

    async fn plan_for(
        store: &MemoryStore,
        providers: &ProviderRegistry,
        config: &Configuration,
    ) -> Plan {
        let prior = store.get(KEY).await.unwrap();
        create_plan(PlanRequest::new(config).with_prior(prior.as_ref()), providers).unwrap()
    }

    async fn apply(
        store: &MemoryStore,
        providers: &ProviderRegistry,
        config: &Configuration,
    ) -> EngineResult<ApplyReport> {
        let plan = plan_for(store, providers, config).await;
        Executor::new(providers, store, KEY)
            .with_config(fast_config())
            .execute(&plan)
            .await
    }

    fn setup() -> (Arc<TestProvider>, ProviderRegistry, MemoryStore) {
        let provider = Arc::new(TestProvider::new());
        let registry = ProviderRegistry::new().with(provider.clone());
        (provider, registry, MemoryStore::new())
    }

    #[tokio::test]
    async fn creates_in_dependency_order_and_persists_each_step() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![
            node("a"),
            node("b").with_attribute("parent", Value::reference(addr("a"), "id")),
        ]);

        let report = apply(&store, &registry, &config).await.unwrap();
        assert!(report.is_success());
        assert_eq!(provider.call_log(), vec!["create node.a", "create node.b"]);

        let stored = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(stored.serial, 2);
        let a_id = stored.attribute(&addr("a"), "id").cloned().unwrap();
        assert_eq!(stored.attribute(&addr("b"), "parent"), Some(&a_id));
        assert_eq!(stored.get(&addr("b")).unwrap().dependencies, vec![addr("a")]);
        assert_eq!(stored.get(&addr("b")).unwrap().schema_version, 1);

        let replan = plan_for(&store, &registry, &config).await;
        assert!(replan.is_empty());
    }

    #[tokio::test]
    async fn failed_step_persists_independent_work() {
        let (provider, registry, store) = setup();
        let names = ["n1", "n2", "n3", "n4", "n5"];
        let config = Configuration::new(names.iter().map(|n| node(n)).collect());
        provider.fail("create", addr("n3"), u32::MAX, false);

        let err = apply(&store, &registry, &config).await.unwrap_err();
        let report = match err {
            EngineError::PartialApply(report) => report,
            other => panic!("Expected PartialApply, got {:?}", other),
        };
        assert_eq!(report.applied.len(), 4);
        assert_eq!(report.errored.len(), 1);
        assert_eq!(report.errored[0].step.address, addr("n3"));

        let stored = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(stored.len(), 4);
        assert!(!stored.contains(&addr("n3")));
    }

    #[tokio::test]
    async fn dependents_of_failed_step_are_skipped() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![
            node("a"),
            node("b").with_attribute("parent", Value::reference(addr("a"), "id")),
            node("c"),
        ]);
        provider.fail("create", addr("a"), u32::MAX, false);

        let err = apply(&store, &registry, &config).await.unwrap_err();
        let report = err.report().unwrap();
        assert_eq!(report.skipped, vec![Step::new(addr("b"), StepKind::Create)]);
        assert_eq!(report.applied, vec![Step::new(addr("c"), StepKind::Create)]);
        assert!(provider.call_log().iter().all(|c| !c.ends_with("node.b")));
    }

    #[tokio::test]
    async fn failed_update_marks_instance_errored() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![node("a").with_attribute("size", Value::Int(1))]);
        apply(&store, &registry, &config).await.unwrap();

        provider.fail("update", addr("a"), 1, false);
        let changed = Configuration::new(vec![node("a").with_attribute("size", Value::Int(2))]);
        assert!(apply(&store, &registry, &changed).await.is_err());

        let stored = store.get(KEY).await.unwrap().unwrap();
        let instance = stored.get(&addr("a")).unwrap();
        assert!(instance.is_errored());
        assert_eq!(instance.attributes.get("size"), Some(&Value::Int(1)));

        apply(&store, &registry, &changed).await.unwrap();
        let stored = store.get(KEY).await.unwrap().unwrap();
        assert!(!stored.get(&addr("a")).unwrap().is_errored());
        assert!(plan_for(&store, &registry, &changed).await.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (provider, registry, store) = setup();
        provider.fail("create", addr("a"), 2, true);

        let report = apply(&store, &registry, &Configuration::new(vec![node("a")]))
            .await
            .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn ordering_holds_under_random_delays() {
        for seed in 0..5u64 {
            let (provider, registry, store) = setup();
            let names: Vec<String> = (0..8).map(|i| format!("n{}", i)).collect();
            let mut decls = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let mut hasher = DefaultHasher::new();
                (seed, i).hash(&mut hasher);
                provider.delay(addr(name), Duration::from_millis(hasher.finish() % 15));

                let mut decl = node(name);
                // Each node depends on up to two earlier ones
                if i >= 1 {
                    decl = decl.with_attribute("parent", Value::reference(addr(&names[i - 1]), "id"));
                }
                if i >= 3 {
                    decl = decl.depends_on(addr(&names[i - 3]));
                }
                decls.push(decl);
            }
            let config = Configuration::new(decls);

            apply(&store, &registry, &config).await.unwrap();

            let calls = provider.calls();
            let finished = |name: &str| {
                calls
                    .iter()
                    .find(|c| c.address == addr(name))
                    .map(|c| c.finished)
                    .unwrap()
            };
            let started = |name: &str| {
                calls
                    .iter()
                    .find(|c| c.address == addr(name))
                    .map(|c| c.started)
                    .unwrap()
            };
            for i in 1..names.len() {
                assert!(finished(&names[i - 1]) < started(&names[i]));
                if i >= 3 {
                    assert!(finished(&names[i - 3]) < started(&names[i]));
                }
            }
        }
    }

    async fn replace_run(create_before_destroy: bool) -> (Arc<TestProvider>, MemoryStore) {
        let (provider, registry, store) = setup();
        let decls = |zone: &str| {
            Configuration::new(vec![
                node("a")
                    .with_attribute("zone", Value::string(zone))
                    .with_lifecycle(Lifecycle {
                        create_before_destroy,
                        ..Lifecycle::default()
                    }),
                node("b").with_attribute("parent", Value::reference(addr("a"), "id")),
            ])
        };
        apply(&store, &registry, &decls("east")).await.unwrap();
        apply(&store, &registry, &decls("west")).await.unwrap();
        assert!(plan_for(&store, &registry, &decls("west")).await.is_empty());
        (provider, store)
    }

    #[tokio::test]
    async fn replace_deletes_before_create_by_default() {
        let (provider, store) = replace_run(false).await;
        assert_eq!(
            provider.call_log()[2..],
            ["delete node.a", "create node.a", "update node.b"]
        );

        let stored = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(
            stored.attribute(&addr("b"), "parent"),
            stored.attribute(&addr("a"), "id")
        );
        assert_eq!(provider.live(&addr("a")), 1);
    }

    #[tokio::test]
    async fn create_before_destroy_keeps_old_object_until_dependents_move() {
        let (provider, store) = replace_run(true).await;
        assert_eq!(
            provider.call_log()[2..],
            ["create node.a", "update node.b", "delete node.a"]
        );

        let stored = store.get(KEY).await.unwrap().unwrap();
        assert!(stored.get(&addr("a")).unwrap().deposed.is_empty());
        assert_eq!(provider.live(&addr("a")), 1);
    }

    #[tokio::test]
    async fn failed_deposed_delete_is_retried_next_run() {
        let (provider, registry, store) = setup();
        let decls = |zone: &str| {
            Configuration::new(vec![
                node("a")
                    .with_attribute("zone", Value::string(zone))
                    .with_lifecycle(Lifecycle {
                        create_before_destroy: true,
                        ..Lifecycle::default()
                    }),
            ])
        };
        apply(&store, &registry, &decls("east")).await.unwrap();
        provider.fail("delete", addr("a"), 1, false);
        assert!(apply(&store, &registry, &decls("west")).await.is_err());

        let stored = store.get(KEY).await.unwrap().unwrap();
        let instance = stored.get(&addr("a")).unwrap();
        assert_eq!(instance.deposed.len(), 1);
        assert_eq!(instance.attributes.get("zone"), Some(&Value::string("west")));
        assert_eq!(provider.live(&addr("a")), 2);

        let plan = plan_for(&store, &registry, &decls("west")).await;
        assert_eq!(plan.mutation_count(), 1);
        apply(&store, &registry, &decls("west")).await.unwrap();
        assert_eq!(provider.live(&addr("a")), 1);
        assert!(plan_for(&store, &registry, &decls("west")).await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_leaves_unstarted_steps() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![
            node("a"),
            node("b").with_attribute("parent", Value::reference(addr("a"), "id")),
            node("c").with_attribute("parent", Value::reference(addr("b"), "id")),
        ]);
        let cancel = CancelHandle::new();
        let hook_cancel = cancel.clone();
        provider.on_call(move |_| hook_cancel.cancel());

        let plan = plan_for(&store, &registry, &config).await;
        let err = Executor::new(&registry, &store, KEY)
            .with_config(fast_config())
            .with_cancel(cancel)
            .execute(&plan)
            .await
            .unwrap_err();

        let report = match err {
            EngineError::Interrupted(report) => report,
            other => panic!("Expected Interrupted, got {:?}", other),
        };
        assert_eq!(report.applied, vec![Step::new(addr("a"), StepKind::Create)]);
        assert_eq!(report.not_started.len(), 2);
        assert_eq!(provider.call_log(), vec!["create node.a"]);
        let stored = store.get(KEY).await.unwrap().unwrap();
        assert!(stored.contains(&addr("a")));
    }

    #[tokio::test]
    async fn deadline_leaves_later_steps_unstarted() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![node("n1"), node("n2"), node("n3")]);
        provider.delay(addr("n1"), Duration::from_millis(200));

        let plan = plan_for(&store, &registry, &config).await;
        let err = Executor::new(&registry, &store, KEY)
            .with_config(ExecutorConfig {
                parallelism: 1,
                deadline: Some(Duration::from_millis(50)),
                ..fast_config()
            })
            .execute(&plan)
            .await
            .unwrap_err();

        let report = match err {
            EngineError::Interrupted(report) => report,
            other => panic!("Expected Interrupted, got {:?}", other),
        };
        assert_eq!(report.applied, vec![Step::new(addr("n1"), StepKind::Create)]);
        let mut not_started = report.not_started.clone();
        not_started.sort();
        assert_eq!(
            not_started,
            vec![
                Step::new(addr("n2"), StepKind::Create),
                Step::new(addr("n3"), StepKind::Create),
            ]
        );
        assert_eq!(provider.call_log(), vec!["create node.n1"]);
        let stored = store.get(KEY).await.unwrap().unwrap();
        assert!(stored.contains(&addr("n1")));
        assert!(!stored.contains(&addr("n2")));
    }

    #[tokio::test]
    async fn unrepresentable_deadline_means_no_deadline() {
        let (_, registry, store) = setup();
        let config = Configuration::new(vec![node("a")]);
        let plan = plan_for(&store, &registry, &config).await;

        let report = Executor::new(&registry, &store, KEY)
            .with_config(ExecutorConfig {
                deadline: Some(Duration::MAX),
                ..fast_config()
            })
            .execute(&plan)
            .await
            .unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn change_timeout_is_passed_to_the_provider() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![
            node("a"),
            node("b").with_attribute("parent", Value::reference(addr("a"), "id")),
        ]);
        let plan = plan_for(&store, &registry, &config).await;

        Executor::new(&registry, &store, KEY)
            .with_config(ExecutorConfig {
                change_timeout: Some(Duration::from_secs(30)),
                ..fast_config()
            })
            .execute(&plan)
            .await
            .unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.timeout == Some(Duration::from_secs(30))));
    }

    async fn refreshed_plan(
        store: &MemoryStore,
        registry: &ProviderRegistry,
        config: &Configuration,
    ) -> (StateSnapshot, Plan) {
        let prior = store.get(KEY).await.unwrap().unwrap();
        let refreshed = crate::refresh::refresh(&prior, registry, &fast_config())
            .await
            .unwrap();
        let plan = create_plan(
            PlanRequest::new(config)
                .with_prior(Some(&prior))
                .with_refresh(Some(&refreshed)),
            registry,
        )
        .unwrap();
        (prior, plan)
    }

    #[tokio::test]
    async fn vanished_undeclared_instance_is_forgotten_without_delete() {
        let (provider, registry, store) = setup();
        apply(&store, &registry, &Configuration::new(vec![node("a"), node("b")]))
            .await
            .unwrap();
        provider.remove_out_of_band(&addr("a"));

        let (prior, plan) =
            refreshed_plan(&store, &registry, &Configuration::new(vec![node("b")])).await;
        assert_eq!(plan.forgotten(), &[addr("a")]);
        assert!(plan.changes().is_empty());
        assert!(!plan.is_empty());

        let report = Executor::new(&registry, &store, KEY)
            .with_config(fast_config())
            .execute(&plan)
            .await
            .unwrap();
        assert!(report.applied.is_empty());
        assert!(!provider.call_log().iter().any(|c| c.starts_with("delete")));

        let stored = store.get(KEY).await.unwrap().unwrap();
        assert!(!stored.contains(&addr("a")));
        assert!(stored.contains(&addr("b")));
        assert_eq!(stored.serial, prior.serial + 1);
    }

    #[tokio::test]
    async fn vanished_instance_keeps_record_until_deposed_objects_are_deleted() {
        let (provider, registry, _) = setup();
        let mut prior = StateSnapshot::new();
        let mut a = ResourceInstanceState::new(addr("a"), "test")
            .with_attribute("name", Value::string("a"))
            .with_attribute("id", Value::string("a-new"));
        a.deposed = vec![Attributes::from([("id".to_string(), Value::string("a-old"))])];
        prior.upsert(a);
        let store = MemoryStore::with_snapshot(KEY, prior);

        let (_, plan) = refreshed_plan(&store, &registry, &Configuration::default()).await;
        assert_eq!(plan.forgotten(), &[addr("a")]);
        assert_eq!(
            plan.ordered_steps(),
            vec![Step::new(addr("a"), StepKind::DeleteDeposed)]
        );

        Executor::new(&registry, &store, KEY)
            .with_config(fast_config())
            .execute(&plan)
            .await
            .unwrap();
        assert_eq!(provider.call_log(), vec!["read node.a", "delete node.a"]);
        let stored = store.get(KEY).await.unwrap().unwrap();
        assert!(!stored.contains(&addr("a")));
    }

    #[tokio::test]
    async fn stale_plan_is_rejected() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![node("a")]);
        let plan = plan_for(&store, &registry, &config).await;

        apply(&store, &registry, &config).await.unwrap();
        let err = Executor::new(&registry, &store, KEY)
            .execute(&plan)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::Conflict {
                expected: None,
                actual: Some(1)
            })
        ));
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn orphans_are_deleted_in_reverse_dependency_order() {
        let (provider, registry, store) = setup();
        let config = Configuration::new(vec![
            node("a"),
            node("b").with_attribute("parent", Value::reference(addr("a"), "id")),
        ]);
        apply(&store, &registry, &config).await.unwrap();

        apply(&store, &registry, &Configuration::default())
            .await
            .unwrap();
        assert_eq!(
            provider.call_log()[2..],
            ["delete node.b", "delete node.a"]
        );
        assert!(store.get(KEY).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn outputs_are_written_after_apply() {
        let (_, registry, store) = setup();
        let config = Configuration::new(vec![node("a")])
            .with_output("a_id", Value::reference(addr("a"), "id"))
            .with_output("missing", Value::reference(addr("a"), "nope"));

        apply(&store, &registry, &config).await.unwrap();
        let stored = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(stored.outputs.get("a_id"), stored.attribute(&addr("a"), "id"));
        assert_eq!(stored.outputs.get("missing"), Some(&Value::Null));
        assert!(plan_for(&store, &registry, &config).await.is_empty());
    }
}
