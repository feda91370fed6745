//! Keel Core
//!
//! Core library of a declarative reconciliation engine: declarations are
//! compared with recorded state and the difference is applied through
//! provider adapters in dependency order.

pub mod address;
pub mod differ;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod plan;
pub mod provider;
pub mod refresh;
pub mod resource;
pub mod retry;
pub mod schema;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod testing;

pub use address::{InstanceKey, ResourceAddress};
pub use engine::{DEFAULT_STATE_KEY, Engine, EngineConfig, LockMode, PlanOptions};
pub use error::{ConfigError, EngineError, EngineResult};
pub use executor::{ApplyReport, CancelHandle, StepFailure};
pub use plan::{Action, Change, Plan};
pub use provider::{ProviderAdapter, ProviderError, ProviderRegistry};
pub use refresh::RefreshResult;
pub use resource::{Attributes, Configuration, ResourceDeclaration, Value};
pub use snapshot::StateSnapshot;
pub use store::{MemoryStore, StateStore, StoreError};
