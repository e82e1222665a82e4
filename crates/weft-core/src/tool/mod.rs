//! Tool registry: named callables with a declared JSON input schema.
//!
//! Tools are invoked from inside activities (never from workflow bodies) and
//! their declarations can be forwarded to an LLM through
//! [`crate::llm::LlmActivity::with_tools`].

pub mod registry;

pub use registry::{ToolError, ToolRegistry};
