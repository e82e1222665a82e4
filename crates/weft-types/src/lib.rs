//! Shared domain types for Weft.
//!
//! This crate contains the core domain types used across the engine:
//! workflow instances, history events, activity failures and options,
//! engine configuration, lifecycle events and LLM request shapes.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod workflow;
