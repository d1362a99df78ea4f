//! Observability subsystem
//!
//! - Structured logging (JSON lines)
//! - Counter metrics
//! - Typed lifecycle events
//!
//! Observability is read-only: nothing here influences execution.
//!
//! ```ignore
//! use shardexec::observability::{Event, Logger};
//!
//! Logger::info(Event::StageFinished.as_str(), &[("stage", "group")]);
//! ```

mod events;
mod logger;
mod metrics;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

/// Log a lifecycle event with fields.
///
/// Failure events go to stderr at ERROR, everything else is TRACE.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    let severity = if event.is_failure() {
        Severity::Error
    } else {
        Severity::Trace
    };
    Logger::log(severity, event.as_str(), fields);
}
