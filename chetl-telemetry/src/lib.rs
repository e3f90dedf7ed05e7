//! Telemetry initialization for chetl binaries and tests.

pub mod tracing;
