//! Observability for the MQTT client
//!
//! Structured logging through `tracing` and per-client counters that can be
//! read as a serializable snapshot.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ClientMetrics, MetricsSnapshot};

// Span macro for structured logging
pub use logging::mqtt_span;
