//! Scripted provider shared by the engine tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::address::ResourceAddress;
use crate::provider::{
    BoxFuture, OperationContext, ProviderAdapter, ProviderError, ProviderResult, ReadOutcome,
};
use crate::resource::{Attributes, ResourceDeclaration, Value};
use crate::schema::{AttributeSchema, AttributeType, ResourceSchema};

pub fn addr(name: &str) -> ResourceAddress {
    ResourceAddress::new("node", name)
}

/// A valid `node` declaration
pub fn node(name: &str) -> ResourceDeclaration {
    ResourceDeclaration::new("node", name).with_attribute("name", Value::string(name))
}

/// One provider call as observed by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    pub address: ResourceAddress,
    pub started: u64,
    pub finished: u64,
    pub failed: bool,
    /// Time budget the engine passed in the operation context
    pub timeout: Option<Duration>,
}

struct Failure {
    remaining: u32,
    transient: bool,
}

type CallHook = Box<dyn Fn(&Call) + Send + Sync>;

/// In-memory provider for the `node` type
///
/// Objects are keyed by their `id`, so a deposed object and its replacement
/// can coexist under one address.
#[derive(Default)]
pub struct TestProvider {
    objects: Mutex<BTreeMap<String, (ResourceAddress, Attributes)>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<(&'static str, ResourceAddress), Failure>>,
    delays: Mutex<HashMap<ResourceAddress, Duration>>,
    hook: Mutex<Option<CallHook>>,
    clock: AtomicU64,
    next_id: AtomicU64,
}

impl TestProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `operation` on `address`
    pub fn fail(&self, operation: &'static str, address: ResourceAddress, times: u32, transient: bool) {
        self.failures.lock().unwrap().insert(
            (operation, address),
            Failure {
                remaining: times,
                transient,
            },
        );
    }

    pub fn delay(&self, address: ResourceAddress, delay: Duration) {
        self.delays.lock().unwrap().insert(address, delay);
    }

    /// Run `hook` after every call completes
    pub fn on_call(&self, hook: impl Fn(&Call) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Successful calls rendered as `operation address`
    pub fn call_log(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| !c.failed)
            .map(|c| format!("{} {}", c.operation, c.address))
            .collect()
    }

    /// Number of live objects for an address
    pub fn live(&self, address: &ResourceAddress) -> usize {
        self.objects
            .lock()
            .unwrap()
            .values()
            .filter(|(a, _)| a == address)
            .count()
    }

    /// Delete every object of an address behind the engine's back
    pub fn remove_out_of_band(&self, address: &ResourceAddress) {
        self.objects.lock().unwrap().retain(|_, (a, _)| a != address);
    }

    /// Change an attribute behind the engine's back
    pub fn set_out_of_band(&self, address: &ResourceAddress, name: &str, value: Value) {
        for (a, attributes) in self.objects.lock().unwrap().values_mut() {
            if a == address {
                attributes.insert(name.to_string(), value.clone());
            }
        }
    }

    async fn call(
        &self,
        operation: &'static str,
        address: &ResourceAddress,
        timeout: Option<Duration>,
    ) -> ProviderResult<()> {
        let started = self.clock.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&(operation, address.clone())) {
                Some(f) if f.remaining > 0 => {
                    f.remaining -= 1;
                    Some(f.transient)
                }
                _ => None,
            }
        };

        let call = Call {
            operation,
            address: address.clone(),
            started,
            finished: self.clock.fetch_add(1, Ordering::SeqCst),
            failed: failure.is_some(),
            timeout,
        };
        self.calls.lock().unwrap().push(call.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(&call);
        }

        match failure {
            Some(true) => Err(ProviderError::transient("throttled").for_resource(address.clone())),
            Some(false) => {
                Err(ProviderError::new("injected failure").for_resource(address.clone()))
            }
            None => Ok(()),
        }
    }

    fn id_of(attributes: &Attributes) -> ProviderResult<String> {
        match attributes.get("id") {
            Some(Value::String(id)) => Ok(id.clone()),
            _ => Err(ProviderError::new("object has no id")),
        }
    }
}

impl ProviderAdapter for TestProvider {
    fn name(&self) -> &str {
        "test"
    }

    fn resource_types(&self) -> Vec<String> {
        vec!["node".to_string()]
    }

    fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        (resource_type == "node").then(|| {
            ResourceSchema::new("node")
                .with_version(1)
                .attribute(AttributeSchema::new("name", AttributeType::String).required())
                .attribute(AttributeSchema::new("size", AttributeType::Int))
                .attribute(AttributeSchema::new(
                    "tags",
                    AttributeType::Set(Box::new(AttributeType::String)),
                ))
                .attribute(AttributeSchema::new(
                    "ports",
                    AttributeType::List(Box::new(AttributeType::Int)),
                ))
                .attribute(AttributeSchema::new("parent", AttributeType::String))
                .attribute(AttributeSchema::new("zone", AttributeType::String).forces_replacement())
                .attribute(AttributeSchema::new("note", AttributeType::String))
                .attribute(AttributeSchema::new("id", AttributeType::String).computed_only())
        })
    }

    fn create(
        &self,
        ctx: &OperationContext,
        config: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<Attributes>> {
        let address = ctx.address.clone();
        let timeout = ctx.timeout;
        let mut attributes = config.clone();
        Box::pin(async move {
            self.call("create", &address, timeout).await?;
            let id = format!(
                "{}-{}",
                address.name,
                self.next_id.fetch_add(1, Ordering::SeqCst)
            );
            attributes.insert("id".to_string(), Value::string(id.clone()));
            self.objects
                .lock()
                .unwrap()
                .insert(id, (address, attributes.clone()));
            Ok(attributes)
        })
    }

    fn read(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<ReadOutcome>> {
        let address = ctx.address.clone();
        let timeout = ctx.timeout;
        let id = Self::id_of(prior);
        Box::pin(async move {
            self.call("read", &address, timeout).await?;
            let id = id?;
            Ok(match self.objects.lock().unwrap().get(&id) {
                Some((_, attributes)) => ReadOutcome::Found(attributes.clone()),
                None => ReadOutcome::NotFound,
            })
        })
    }

    fn update(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
        desired: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<Attributes>> {
        let address = ctx.address.clone();
        let timeout = ctx.timeout;
        let id = Self::id_of(prior);
        let mut attributes = desired.clone();
        Box::pin(async move {
            self.call("update", &address, timeout).await?;
            let id = id?;
            attributes.insert("id".to_string(), Value::string(id.clone()));
            self.objects
                .lock()
                .unwrap()
                .insert(id, (address, attributes.clone()));
            Ok(attributes)
        })
    }

    fn delete(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let address = ctx.address.clone();
        let timeout = ctx.timeout;
        let id = Self::id_of(prior);
        Box::pin(async move {
            self.call("delete", &address, timeout).await?;
            if let Ok(id) = id {
                self.objects.lock().unwrap().remove(&id);
            }
            Ok(())
        })
    }
}
