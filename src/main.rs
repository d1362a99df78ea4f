//! shardexec CLI entry point
//!
//! Parses arguments and delegates to the CLI module; exits non-zero on
//! failure after the error envelope has been printed.

use shardexec::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
