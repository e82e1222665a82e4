//! Replay orchestrator, scheduler and repository traits for Weft.
//!
//! This crate defines the "ports" (repository and LLM provider traits) that
//! the infrastructure layer implements. It depends only on `weft-types` --
//! never on `weft-infra` or any database/IO crate.

pub mod event;
pub mod llm;
pub mod repository;
pub mod tool;
pub mod workflow;
