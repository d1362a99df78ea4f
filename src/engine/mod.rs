//! Projection execution core
//!
//! - `projector`: the push-based stage contract and its state machine
//! - `compiler`: projection to projector compilation
//! - `pipeline`: chain wiring and the row driver
//! - `ram`: per-job memory accounting
//! - `context`: job identity, shard binding and row-failure log
//! - `services`: routing and transport handles shared by stages

mod compiler;
mod context;
mod errors;
mod pipeline;
mod projector;
pub mod ram;
mod services;

pub use compiler::ProjectorFactory;
pub use context::{ExecutionContext, FailureLog, RowFailure};
pub use errors::{ErrorCategory, ExecResult, ExecutionError};
pub use pipeline::{execute, ProjectorChain};
pub use projector::{
    CollectorHandle, Downstream, Lifecycle, Projector, ProjectorState, RowCollector, RowFlow,
    RowReceiver,
};
pub use ram::{RamAccountingContext, StageMemory};
pub use services::ClusterServices;
