//! Core data models for the blob registry.
//!
//! These entities map to the metadata tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod blob;
pub mod project;
pub mod upload;
