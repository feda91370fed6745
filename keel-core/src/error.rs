//! Error types shared across the engine

use thiserror::Error;

use crate::address::ResourceAddress;
use crate::executor::ApplyReport;
use crate::provider::{Diagnostic, ProviderError};
use crate::store::StoreError;

/// Problems with the declarations themselves; always raised before any mutation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Dependency cycle: {path}")]
    Cycle { path: String },

    #[error("Duplicate resource address: {0}")]
    DuplicateAddress(ResourceAddress),

    #[error("{address} references undeclared {reference}")]
    UnknownReference {
        address: ResourceAddress,
        reference: String,
    },

    #[error("{address} depends on undeclared {dependency}")]
    UnknownDependency {
        address: ResourceAddress,
        dependency: ResourceAddress,
    },

    #[error("Invalid lifecycle for {address}: {reason}")]
    InvalidLifecycle {
        address: ResourceAddress,
        reason: String,
    },

    #[error("No provider handles resource type '{resource_type}' (used by {address})")]
    UnknownResourceType {
        address: ResourceAddress,
        resource_type: String,
    },

    #[error("Invalid configuration for {address}: {}", join_diagnostics(.diagnostics))]
    Validation {
        address: ResourceAddress,
        diagnostics: Vec<Diagnostic>,
    },
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run-level errors returned to the caller
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Refresh could not read a resource
    #[error("Refresh failed: {0}")]
    Provider(#[from] ProviderError),

    /// The plan would delete or replace protected resources; nothing was changed
    #[error("Refusing to destroy protected resources: {}", join_addresses(.addresses))]
    PreventDestroy { addresses: Vec<ResourceAddress> },

    /// Some changes failed; completed work has been persisted
    #[error("Apply partially failed: {}", .0.summary())]
    PartialApply(Box<ApplyReport>),

    /// Cancelled or past the deadline before every change ran
    #[error("Apply interrupted: {}", .0.summary())]
    Interrupted(Box<ApplyReport>),
}

fn join_addresses(addresses: &[ResourceAddress]) -> String {
    addresses
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineError {
    /// Lock contention and serial conflicts can be retried by re-running
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_retryable())
    }

    /// The report of a run that made partial progress
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            EngineError::PartialApply(report) | EngineError::Interrupted(report) => Some(report),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
