//! Observable execution events
//!
//! Events are explicit and typed. Each maps to one stable uppercase name
//! used as the `event` key of a log line.

use std::fmt;

/// Observable events of the execution core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Configuration
    /// Execution settings loaded
    ConfigLoaded,

    // Stage lifecycle
    /// Projection compiled into a projector
    StageCompiled,
    /// Projector reached normal completion
    StageFinished,
    /// Projector failed
    StageFailed,

    // Batched writes
    /// Bulk request handed to the transport
    BulkDispatched,
    /// Bulk request failed as a whole
    BulkFailed,
    /// Dispatch waited for a free per-node slot
    AdmissionWait,
    /// Missing target index created
    IndexCreated,

    // Fetch
    /// Fetch response was missing requested documents
    FetchPartial,

    // Resources
    /// Memory budget refused a charge
    MemoryLimitExceeded,

    // Export
    /// Export file flushed and closed
    FileWriterClosed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::StageCompiled => "STAGE_COMPILED",
            Event::StageFinished => "STAGE_FINISHED",
            Event::StageFailed => "STAGE_FAILED",

            Event::BulkDispatched => "BULK_DISPATCHED",
            Event::BulkFailed => "BULK_FAILED",
            Event::AdmissionWait => "ADMISSION_WAIT",
            Event::IndexCreated => "INDEX_CREATED",

            Event::FetchPartial => "FETCH_PARTIAL",

            Event::MemoryLimitExceeded => "MEMORY_LIMIT_EXCEEDED",

            Event::FileWriterClosed => "FILE_WRITER_CLOSED",
        }
    }

    /// Returns true if this event indicates a stage failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Event::StageFailed | Event::MemoryLimitExceeded)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
