//! LLM provider abstractions.
//!
//! - `LlmProvider`: RPITIT trait for concrete provider implementations
//! - `BoxLlmProvider`: object-safe wrapper for dynamic dispatch
//! - `LlmActivity`: an activity that renders a prompt, calls a provider and
//!   optionally extracts structured JSON from the reply

pub mod activity;
pub mod box_provider;
pub mod provider;

pub use activity::LlmActivity;
pub use box_provider::BoxLlmProvider;
pub use provider::LlmProvider;
