//! Orchestration core: event dispatcher and module registry
//!
//! The host builds one [`EventDispatcher`] and one [`ModuleRegistry`] (the
//! registry holds a reference to the dispatcher), registers its modules, and
//! drives them through the lifecycle. Modules communicate through the
//! dispatcher instead of calling each other directly.

pub mod dispatcher;
pub mod middleware;
pub mod registry;

pub use dispatcher::{DispatcherHealth, DispatcherMetrics, EventDispatcher, EventFilter};
pub use registry::{ModuleRegistry, RegistryHealth, RegistryStats};
