//! Batched writes to shards
//!
//! - `bulk`: per-shard batching, per-node admission and result merging
//! - `index_writer`: source and column inserts
//! - `dml`: shard-local update and delete
//! - `create_index`: deduplicated creation of missing target indices

mod bulk;
mod create_index;
mod dml;
mod index_name;
mod index_writer;
mod result;

pub use bulk::{BulkConfig, ShardedBatchExecutor};
pub use create_index::IndexCreationTracker;
pub use dml::ShardDmlProjector;
pub use index_name::{
    partition_index_name, partition_values, DocAddress, DocAddressBuilder, IndexNameResolver,
    PARTITIONED_PREFIX,
};
pub use index_writer::IndexWriterProjector;
pub use result::BulkSummary;
