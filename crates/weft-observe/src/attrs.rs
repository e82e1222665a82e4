//! Span attribute names for workflow instrumentation.
//!
//! Field names are dotted under the `weft.` namespace so exported OTel spans
//! group cleanly. Use them as constant field names:
//!
//! ```
//! use weft_observe::attrs;
//!
//! let span = tracing::info_span!(
//!     "weft.command",
//!     { attrs::OPERATION } = attrs::OP_RUN,
//!     { attrs::WORKFLOW_NAME } = "recipe_builder",
//! );
//! # drop(span);
//! ```

// --- Field names ---

/// CLI operation being performed (one of the `OP_*` values).
pub const OPERATION: &str = "weft.operation";

/// Name of the registered workflow definition.
pub const WORKFLOW_NAME: &str = "weft.workflow.name";

/// Instance id (UUID v7).
pub const INSTANCE_ID: &str = "weft.instance.id";

/// Status the instance ended the operation in.
pub const INSTANCE_STATUS: &str = "weft.instance.status";

/// Number of instances touched by a bulk operation.
pub const INSTANCE_COUNT: &str = "weft.instance.count";

// --- Operation values ---

/// Start a new instance and drive it to completion.
pub const OP_RUN: &str = "run";

/// Start a new instance without driving it.
pub const OP_START: &str = "start";

/// Replay and continue an existing instance.
pub const OP_RESUME: &str = "resume";

/// Resume every instance left running by a previous process.
pub const OP_RECOVER: &str = "recover";

/// Cancel a running instance.
pub const OP_CANCEL: &str = "cancel";
