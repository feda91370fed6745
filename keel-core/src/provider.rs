//! Provider - Trait abstracting resource operations
//!
//! A Provider Adapter implements CRUD for one or more resource types and
//! publishes a static schema per type. The engine depends only on this trait;
//! an adapter may run in-process or forward calls over RPC.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::address::ResourceAddress;
use crate::resource::Attributes;
use crate::schema::ResourceSchema;

/// How the engine should treat a failed provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Worth retrying (rate limiting, throttling, timeouts)
    Transient,
    /// Retrying will not help
    Permanent,
}

/// Error type for Provider operations
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub address: Option<ResourceAddress>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref address) = self.address {
            write!(f, "[{}] {}", address, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    /// A permanent error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
            address: None,
            cause: None,
        }
    }

    /// An error the engine retries with backoff
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            ..Self::new(message)
        }
    }

    pub fn for_resource(mut self, address: ResourceAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-call context handed to the adapter
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub address: ResourceAddress,
    /// Time budget for this call; enforcing it is up to the adapter
    pub timeout: Option<Duration>,
}

impl OperationContext {
    pub fn new(address: ResourceAddress) -> Self {
        Self {
            address,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of reading a resource
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Found(Attributes),
    /// The object no longer exists
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Validation finding reported by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub attribute: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            attribute: None,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    pub fn for_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}: {}", attr, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Main Provider Adapter trait
///
/// All operations are async and involve side effects. `Create` and `Update`
/// return the full attribute set of the object after the call, including
/// computed attributes.
pub trait ProviderAdapter: Send + Sync {
    /// Name of this Provider (e.g., "file")
    fn name(&self) -> &str;

    /// Resource types this Provider can handle
    fn resource_types(&self) -> Vec<String>;

    /// Static schema for a resource type
    fn schema(&self, resource_type: &str) -> Option<ResourceSchema>;

    /// Check a configuration before planning
    ///
    /// Values that reference other resources may still be unresolved.
    fn validate(&self, address: &ResourceAddress, config: &Attributes) -> Vec<Diagnostic> {
        let Some(schema) = self.schema(&address.resource_type) else {
            return Vec::new();
        };
        match schema.validate(config) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .into_iter()
                .map(|(attr, e)| Diagnostic::error(e.to_string()).for_attribute(attr))
                .collect(),
        }
    }

    /// Create an object from its configuration
    fn create(
        &self,
        ctx: &OperationContext,
        config: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<Attributes>>;

    /// Read the real-world attributes of an object
    fn read(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<ReadOutcome>>;

    /// Update an object in place
    fn update(
        &self,
        ctx: &OperationContext,
        prior: &Attributes,
        desired: &Attributes,
    ) -> BoxFuture<'_, ProviderResult<Attributes>>;

    /// Delete an object
    fn delete(&self, ctx: &OperationContext, prior: &Attributes)
    -> BoxFuture<'_, ProviderResult<()>>;
}

/// Maps resource types to the adapters that manage them
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_type: BTreeMap<String, Arc<dyn ProviderAdapter>>,
    fallback: Option<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for every resource type it reports
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        for resource_type in adapter.resource_types() {
            self.by_type.insert(resource_type, adapter.clone());
        }
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter used for resource types no registered adapter claims
    pub fn with_fallback(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    pub fn get(&self, resource_type: &str) -> Option<&Arc<dyn ProviderAdapter>> {
        self.by_type.get(resource_type).or(self.fallback.as_ref())
    }

    pub fn schema(&self, resource_type: &str) -> Option<ResourceSchema> {
        self.get(resource_type)
            .and_then(|adapter| adapter.schema(resource_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Value;
    use crate::schema::{AttributeSchema, AttributeType};

    // Mock Provider for testing
    struct MockProvider;

    impl ProviderAdapter for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn resource_types(&self) -> Vec<String> {
            vec!["mock_thing".to_string()]
        }

        fn schema(&self, _resource_type: &str) -> Option<ResourceSchema> {
            Some(
                ResourceSchema::new("mock_thing")
                    .attribute(AttributeSchema::new("name", AttributeType::String).required())
                    .attribute(AttributeSchema::new("id", AttributeType::String).computed_only()),
            )
        }

        fn create(
            &self,
            _ctx: &OperationContext,
            config: &Attributes,
        ) -> BoxFuture<'_, ProviderResult<Attributes>> {
            let mut attrs = config.clone();
            Box::pin(async move {
                attrs.insert("id".to_string(), Value::string("mock-id-123"));
                Ok(attrs)
            })
        }

        fn read(
            &self,
            _ctx: &OperationContext,
            _prior: &Attributes,
        ) -> BoxFuture<'_, ProviderResult<ReadOutcome>> {
            Box::pin(async { Ok(ReadOutcome::NotFound) })
        }

        fn update(
            &self,
            _ctx: &OperationContext,
            _prior: &Attributes,
            desired: &Attributes,
        ) -> BoxFuture<'_, ProviderResult<Attributes>> {
            let attrs = desired.clone();
            Box::pin(async move { Ok(attrs) })
        }

        fn delete(
            &self,
            _ctx: &OperationContext,
            _prior: &Attributes,
        ) -> BoxFuture<'_, ProviderResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn ctx() -> OperationContext {
        OperationContext::new(ResourceAddress::new("mock_thing", "example"))
    }

    #[tokio::test]
    async fn mock_provider_read_returns_not_found() {
        let outcome = MockProvider.read(&ctx(), &Attributes::new()).await.unwrap();
        assert_eq!(outcome, ReadOutcome::NotFound);
    }

    #[tokio::test]
    async fn mock_provider_create_returns_computed_id() {
        let attrs = MockProvider.create(&ctx(), &Attributes::new()).await.unwrap();
        assert_eq!(attrs.get("id"), Some(&Value::string("mock-id-123")));
    }

    #[test]
    fn default_validate_uses_schema() {
        let diagnostics = MockProvider.validate(&ctx().address, &Attributes::new());
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].is_error());
        assert_eq!(diagnostics[0].attribute.as_deref(), Some("name"));
    }

    #[test]
    fn registry_uses_fallback() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider))
            .with_fallback(Arc::new(MockProvider));
        assert!(registry.get("mock_thing").is_some());
        assert!(registry.get("other").is_some());
        assert!(ProviderRegistry::new().get("other").is_none());
    }

    #[test]
    fn provider_error_display_includes_address() {
        let err = ProviderError::transient("rate limited")
            .for_resource(ResourceAddress::new("mock_thing", "a"));
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "[mock_thing.a] rate limited");
    }
}
