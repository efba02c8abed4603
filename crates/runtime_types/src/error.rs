//! Error taxonomy for the runtime core
//!
//! Most failures are recovered close to their origin (logged and counted);
//! only the errors below are surfaced to callers as named types. A cyclic
//! dependency is the one hard, user-visible failure: it means the module set
//! itself is structurally broken.

use thiserror::Error;

/// Invalid subscription input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("subscription must name at least one event type")]
    EmptyEventTypes,
}

/// Dependency-resolution failures in the module registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cyclic dependency detected at module '{0}'")]
    CyclicDependency(String),

    #[error("module '{module}' depends on unregistered module '{dependency}'")]
    MissingDependency { module: String, dependency: String },
}
