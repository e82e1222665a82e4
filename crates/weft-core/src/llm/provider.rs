//! LlmProvider trait definition.
//!
//! The abstraction activity handlers use to reach an LLM backend. Uses RPITIT
//! for `complete`; [`super::box_provider::BoxLlmProvider`] provides dynamic
//! dispatch.

use weft_types::llm::{CompletionRequest, CompletionResponse, LlmError};

/// Trait for LLM provider backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Concrete
/// network clients are supplied by the embedding application.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "anthropic", "openai").
    fn name(&self) -> &str;

    /// Send a completion request and receive the full response.
    fn complete(
        &self,
        request: &CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, LlmError>> + Send;
}
