//! Keel State Management
//!
//! State Store backends for the Keel infrastructure tool. The store
//! contract itself (`StateStore`, `StoreError`, `LockInfo`) lives in
//! keel-core; this crate provides persistent implementations and picks one
//! from configuration.
//!
//! # Example
//!
//! ```ignore
//! use keel_state::{create_backend, BackendConfig};
//!
//! let config = BackendConfig::local(".keel");
//! let store = create_backend(&config).await?;
//!
//! let lock = store.try_lock(config.state_key(), "apply", ttl).await?;
//! let snapshot = store.get(config.state_key()).await?;
//! // ... plan and apply ...
//! store.unlock(config.state_key(), &lock).await?;
//! ```

pub mod backend;
pub mod backends;

pub use backend::BackendConfig;
pub use backends::{LocalBackend, create_backend};
