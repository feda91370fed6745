//! Backend implementations for state storage

mod local;

pub use local::LocalBackend;

use keel_core::store::{MemoryStore, StateStore, StoreError, StoreResult};

use crate::backend::BackendConfig;

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub async fn create_backend(config: &BackendConfig) -> StoreResult<Box<dyn StateStore>> {
    match config.backend_type.as_str() {
        "local" => {
            let backend = LocalBackend::from_config(config)?;
            Ok(Box::new(backend))
        }
        "memory" => Ok(Box::new(MemoryStore::new())),
        other => Err(StoreError::unsupported_backend(other)),
    }
}
