//! Refresh - Read tracked instances back from their providers
//!
//! The result is a copy of the snapshot reflecting the real world. The
//! store is never written here; the Differ plans from the copy.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::address::ResourceAddress;
use crate::error::{ConfigError, EngineResult};
use crate::executor::ExecutorConfig;
use crate::provider::{OperationContext, ProviderAdapter, ProviderRegistry, ProviderResult, ReadOutcome};
use crate::resource::Attributes;
use crate::retry::RetryPolicy;
use crate::snapshot::StateSnapshot;

/// Real-world view of a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshResult {
    pub snapshot: StateSnapshot,
    /// Instances whose attributes changed outside of Keel
    pub updated: Vec<ResourceAddress>,
    /// Instances their provider no longer finds
    pub disappeared: Vec<ResourceAddress>,
}

impl RefreshResult {
    pub fn has_drift(&self) -> bool {
        !self.updated.is_empty() || !self.disappeared.is_empty()
    }
}

/// Read every tracked instance, at most `config.parallelism` at a time
pub async fn refresh(
    snapshot: &StateSnapshot,
    providers: &ProviderRegistry,
    config: &ExecutorConfig,
) -> EngineResult<RefreshResult> {
    let mut pending = VecDeque::new();
    for instance in snapshot.resources.values() {
        let adapter = providers
            .get(&instance.address.resource_type)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownResourceType {
                address: instance.address.clone(),
                resource_type: instance.address.resource_type.clone(),
            })?;
        pending.push_back((instance.address.clone(), instance.attributes.clone(), adapter));
    }

    log::info!("Refreshing {} instances", pending.len());

    let mut result = RefreshResult {
        snapshot: snapshot.clone(),
        updated: Vec::new(),
        disappeared: Vec::new(),
    };
    let parallelism = config.parallelism.max(1);
    let mut tasks = JoinSet::new();

    loop {
        while tasks.len() < parallelism {
            let Some((address, prior, adapter)) = pending.pop_front() else {
                break;
            };
            let ctx = OperationContext::new(address).with_timeout(config.change_timeout);
            tasks.spawn(read_instance(adapter, ctx, prior, config.retry.clone()));
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (address, outcome) = match joined {
            Ok(read) => read,
            Err(e) => {
                log::error!("Refresh task failed: {}", e);
                continue;
            }
        };

        match outcome? {
            ReadOutcome::Found(attributes) => {
                if let Some(instance) = result.snapshot.get_mut(&address) {
                    if instance.attributes != attributes {
                        log::debug!("{}: changed outside of Keel", address);
                        instance.attributes = attributes;
                        result.updated.push(address);
                    }
                }
            }
            ReadOutcome::NotFound => {
                log::debug!("{}: no longer exists", address);
                result.snapshot.remove(&address);
                result.disappeared.push(address);
            }
        }
    }

    result.updated.sort();
    result.disappeared.sort();
    Ok(result)
}

async fn read_instance(
    adapter: Arc<dyn ProviderAdapter>,
    ctx: OperationContext,
    prior: Attributes,
    retry: RetryPolicy,
) -> (ResourceAddress, ProviderResult<ReadOutcome>) {
    let result = retry
        .run(&ctx.address, "read", || adapter.read(&ctx, &prior))
        .await
        .map_err(|e| {
            if e.address.is_none() {
                e.for_resource(ctx.address.clone())
            } else {
                e
            }
        });
    (ctx.address, result)
}
