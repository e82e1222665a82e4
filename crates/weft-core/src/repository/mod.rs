//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (weft-infra) implements. The core crate never depends on any specific
//! storage technology.

pub mod memory;
pub mod workflow;

pub use memory::MemoryWorkflowRepository;
pub use workflow::WorkflowRepository;
