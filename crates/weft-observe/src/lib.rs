//! Observability for Weft: subscriber setup and span attribute names.

pub mod attrs;
pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
