//! Backend configuration

use std::collections::HashMap;

use keel_core::DEFAULT_STATE_KEY;
use keel_core::resource::Value;

/// Configuration for a State Store backend
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend type ("local", "memory")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Local backend storing snapshots under `path`
    pub fn local(path: impl Into<String>) -> Self {
        Self::new("local").with_attribute("path", Value::String(path.into()))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Key the snapshot is stored under
    pub fn state_key(&self) -> &str {
        self.get_string("key").unwrap_or(DEFAULT_STATE_KEY)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::local(".keel")
    }
}
