//! ra-db: durable job storage.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, row models, and the JobStore query functions.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
