//! Snapshot - Persisted record of every managed resource instance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::ResourceAddress;
use crate::resource::{Attributes, Value};

/// Status of a tracked instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Managed,
    /// The last operation on this instance failed; the next plan reconciles it
    Errored,
}

/// State of a single managed resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceState {
    pub address: ResourceAddress,
    /// Name of the provider that manages this instance
    pub provider: String,
    pub schema_version: u64,
    pub attributes: Attributes,
    #[serde(default)]
    pub status: InstanceStatus,
    /// Replace this instance on the next apply
    #[serde(default)]
    pub tainted: bool,
    /// Protected from deletion even after the declaration goes away
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Instances this one depended on when last applied
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
    /// Old objects left behind by create-before-destroy replaces, awaiting deletion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<Attributes>,
}

impl ResourceInstanceState {
    pub fn new(address: ResourceAddress, provider: impl Into<String>) -> Self {
        Self {
            address,
            provider: provider.into(),
            schema_version: 0,
            attributes: Attributes::new(),
            status: InstanceStatus::Managed,
            tainted: false,
            prevent_destroy: false,
            dependencies: Vec::new(),
            deposed: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ResourceAddress>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_tainted(mut self, tainted: bool) -> Self {
        self.tainted = tainted;
        self
    }

    pub fn with_prevent_destroy(mut self, prevent_destroy: bool) -> Self {
        self.prevent_destroy = prevent_destroy;
        self
    }

    pub fn is_errored(&self) -> bool {
        self.status == InstanceStatus::Errored
    }
}

/// The persisted state of one lineage at one serial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot format version
    pub version: u32,
    /// Monotonically increasing number for each successful write
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of Keel that last wrote this snapshot
    pub keel_version: String,
    pub resources: BTreeMap<ResourceAddress, ResourceInstanceState>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl StateSnapshot {
    /// Current snapshot format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create an empty snapshot with a fresh lineage
    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty snapshot with a specific lineage
    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            keel_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Increment serial and stamp the writing version
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.keel_version = env!("CARGO_PKG_VERSION").to_string();
    }

    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceInstanceState> {
        self.resources.get(address)
    }

    pub fn get_mut(&mut self, address: &ResourceAddress) -> Option<&mut ResourceInstanceState> {
        self.resources.get_mut(address)
    }

    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.resources.contains_key(address)
    }

    /// Add or replace an instance
    pub fn upsert(&mut self, instance: ResourceInstanceState) {
        self.resources.insert(instance.address.clone(), instance);
    }

    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceInstanceState> {
        self.resources.remove(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.resources.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Look up an attribute value of a tracked instance
    pub fn attribute(&self, address: &ResourceAddress, attribute: &str) -> Option<&Value> {
        self.resources
            .get(address)
            .and_then(|r| r.attributes.get(attribute))
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
