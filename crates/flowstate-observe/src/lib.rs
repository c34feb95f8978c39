//! Observability for Flowstate: subscriber installation and OpenTelemetry
//! export of engine spans.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing, ObserveError, TracingOptions};
