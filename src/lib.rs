//! shardexec - streaming projector execution core
//!
//! Compiles logical projections (filter, eval, top-N, grouping, bulk
//! indexing, update/delete, fetch, file export, system-table update) into
//! push-based projectors, chains them, and drives rows through them
//! against pluggable cluster collaborators.

pub mod aggregation;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod data;
pub mod engine;
pub mod expression;
pub mod indexing;
pub mod observability;
pub mod projection;
pub mod projectors;
