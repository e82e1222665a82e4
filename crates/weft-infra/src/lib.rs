//! Infrastructure layer for Weft.
//!
//! Contains the SQLite implementation of the `WorkflowRepository` trait
//! defined in `weft-core`, the engine configuration loader, and data
//! directory resolution.

pub mod config;
pub mod filesystem;
pub mod sqlite;
