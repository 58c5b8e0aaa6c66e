//! Observability: structured logging, metrics and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, DropReason, MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{bridge_span, message_span, mqtt_span};
