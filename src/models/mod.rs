//! Core data models for the file resource store.
//!
//! Resources and versions map to SQLite rows via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod resource;
pub mod search;
