//! ra-core: shared types, ids, errors, and configuration.
//!
//! This crate is the foundational dependency for all other ra-* crates,
//! providing the job/step data model, the step summary union, a unified
//! error type, and application configuration.

pub mod config;
pub mod error;
pub mod ids;
pub mod job;
pub mod summary;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use job::*;
pub use summary::*;
