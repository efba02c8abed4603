//! Shared types for the modular runtime orchestration core
//!
//! This crate contains the core types and traits used throughout the runtime,
//! including the event model, the module lifecycle contract, configuration
//! types, and the error taxonomy.

pub mod config;
pub mod error;
pub mod event;
pub mod module;

// Re-export commonly used types
pub use config::*;
pub use error::*;
pub use event::*;
pub use module::*;
