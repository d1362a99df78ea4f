//! CLI module for shardexec
//!
//! Provides command-line interface for:
//! - run: Execute a projection plan over a row file
//! - validate: Compile a projection plan without executing it

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{run, run_command, run_plan, validate_plan};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_json_file, write_error, write_response};
