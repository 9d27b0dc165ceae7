//! Observability setup for stepwise: structured logging with optional
//! OpenTelemetry span export.

pub mod tracing_setup;
