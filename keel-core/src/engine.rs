//! Engine - Plan, apply and refresh against one State Store
//!
//! Mutating operations hold the store lock for their whole duration and
//! release it on every path, including failures.

use std::sync::Arc;
use std::time::Duration;

use crate::address::ResourceAddress;
use crate::differ::{PlanRequest, create_plan};
use crate::error::EngineResult;
use crate::executor::{ApplyReport, CancelHandle, Executor, ExecutorConfig};
use crate::lock::{DEFAULT_LOCK_TTL_SECS, LockInfo, LockRequest};
use crate::plan::Plan;
use crate::provider::ProviderRegistry;
use crate::refresh::{RefreshResult, refresh};
use crate::resource::Configuration;
use crate::retry::RetryPolicy;
use crate::snapshot::StateSnapshot;
use crate::store::{StateStore, StoreError};

/// Key used when the configuration names none
pub const DEFAULT_STATE_KEY: &str = "default";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of provider calls in flight
    pub parallelism: usize,
    pub retry: RetryPolicy,
    /// How long a lock stays valid if its holder disappears
    pub lock_ttl: Duration,
    /// How long to wait for a busy lock
    pub lock_timeout: Duration,
    /// No change is started after this much time
    pub deadline: Option<Duration>,
    /// Time budget for one provider call
    pub change_timeout: Option<Duration>,
    pub state_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            retry: RetryPolicy::default(),
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS as u64),
            lock_timeout: Duration::ZERO,
            deadline: None,
            change_timeout: None,
            state_key: DEFAULT_STATE_KEY.to_string(),
        }
    }
}

impl EngineConfig {
    fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            parallelism: self.parallelism,
            retry: self.retry.clone(),
            change_timeout: self.change_timeout,
            deadline: self.deadline,
        }
    }
}

/// Locking behaviour of plan-only runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    /// Hold the lock while planning
    #[default]
    Exclusive,
    /// Plan without the lock; the result may be stale by the time it is read
    Relaxed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Read every tracked instance from its provider before planning
    pub refresh: bool,
    /// Plan the deletion of everything tracked
    pub destroy: bool,
    pub lock_mode: LockMode,
}

impl PlanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_destroy(mut self, destroy: bool) -> Self {
        self.destroy = destroy;
        self
    }

    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }
}

pub struct Engine {
    providers: ProviderRegistry,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    cancel: CancelHandle,
}

impl Engine {
    pub fn new(providers: ProviderRegistry, store: Arc<dyn StateStore>, config: EngineConfig) -> Self {
        Self {
            providers,
            store,
            config,
            cancel: CancelHandle::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Handle that stops running applies from starting further changes
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// The stored snapshot, if any
    pub async fn state(&self) -> EngineResult<Option<StateSnapshot>> {
        Ok(self.store.get(&self.config.state_key).await?)
    }

    /// Compute the Plan for a configuration without changing anything
    pub async fn plan(&self, config: &Configuration, options: PlanOptions) -> EngineResult<Plan> {
        match options.lock_mode {
            LockMode::Relaxed => self.plan_unlocked(config, options).await,
            LockMode::Exclusive => {
                let lock = self.lock("plan").await?;
                let result = self.plan_unlocked(config, options).await;
                self.unlock(&lock).await;
                result
            }
        }
    }

    /// Plan and execute in one locked run
    pub async fn apply(&self, config: &Configuration, options: PlanOptions) -> EngineResult<ApplyReport> {
        let operation = if options.destroy { "destroy" } else { "apply" };
        let lock = self.lock(operation).await?;
        let result = match self.plan_unlocked(config, options).await {
            Ok(plan) => self.execute(&plan).await,
            Err(e) => Err(e),
        };
        self.unlock(&lock).await;
        result
    }

    /// Execute a previously computed Plan
    ///
    /// Fails with `StoreError::Conflict` if the state changed since planning.
    pub async fn apply_plan(&self, plan: &Plan) -> EngineResult<ApplyReport> {
        let operation = if plan.is_destroy() { "destroy" } else { "apply" };
        let lock = self.lock(operation).await?;
        let result = self.execute(plan).await;
        self.unlock(&lock).await;
        result
    }

    /// Read the real-world view of the stored snapshot; nothing is persisted
    pub async fn refresh(&self) -> EngineResult<RefreshResult> {
        let snapshot = self
            .store
            .get(&self.config.state_key)
            .await?
            .unwrap_or_default();
        refresh(&snapshot, &self.providers, &self.config.executor_config()).await
    }

    /// Mark or unmark a tracked instance for replacement on the next apply
    pub async fn set_tainted(&self, address: &ResourceAddress, tainted: bool) -> EngineResult<()> {
        let lock = self.lock(if tainted { "taint" } else { "untaint" }).await?;
        let result = self.write_tainted(address, tainted).await;
        self.unlock(&lock).await;
        result
    }

    /// Break a lock left behind by a crashed run
    pub async fn force_unlock(&self, lock_id: &str) -> EngineResult<()> {
        log::warn!("Force unlocking {} ({})", self.config.state_key, lock_id);
        Ok(self
            .store
            .force_unlock(&self.config.state_key, lock_id)
            .await?)
    }

    async fn write_tainted(&self, address: &ResourceAddress, tainted: bool) -> EngineResult<()> {
        let key = &self.config.state_key;
        let mut snapshot = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| StoreError::InvalidState(format!("{} is not tracked", address)))?;
        let read_serial = snapshot.serial;

        let instance = snapshot
            .get_mut(address)
            .ok_or_else(|| StoreError::InvalidState(format!("{} is not tracked", address)))?;
        if instance.tainted == tainted {
            return Ok(());
        }
        instance.tainted = tainted;

        snapshot.increment_serial();
        self.store.write(key, &snapshot, Some(read_serial)).await?;
        log::info!(
            "{} {}",
            address,
            if tainted { "tainted" } else { "untainted" }
        );
        Ok(())
    }

    async fn plan_unlocked(&self, config: &Configuration, options: PlanOptions) -> EngineResult<Plan> {
        let prior = self.store.get(&self.config.state_key).await?;
        let refreshed = match &prior {
            Some(snapshot) if options.refresh => {
                Some(refresh(snapshot, &self.providers, &self.config.executor_config()).await?)
            }
            _ => None,
        };

        let request = PlanRequest::new(config)
            .with_prior(prior.as_ref())
            .with_refresh(refreshed.as_ref())
            .destroy(options.destroy);
        let plan = create_plan(request, &self.providers)?;
        log::info!("{}", plan.summary());
        Ok(plan)
    }

    async fn execute(&self, plan: &Plan) -> EngineResult<ApplyReport> {
        Executor::new(&self.providers, self.store.as_ref(), &self.config.state_key)
            .with_config(self.config.executor_config())
            .with_cancel(self.cancel.clone())
            .execute(plan)
            .await
    }

    async fn lock(&self, operation: &str) -> EngineResult<LockInfo> {
        let request = LockRequest::new(operation)
            .with_ttl(self.config.lock_ttl)
            .with_timeout(self.config.lock_timeout);
        let lock = self.store.lock(&self.config.state_key, &request).await?;
        log::debug!("Acquired lock {} for {}", lock.id, operation);
        Ok(lock)
    }

    async fn unlock(&self, lock: &LockInfo) {
        if let Err(e) = self.store.unlock(&self.config.state_key, lock).await {
            log::warn!("Failed to release lock {}: {}", lock.id, e);
        }
    }
}
