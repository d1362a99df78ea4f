//! Row-transforming stages
//!
//! Each stage implements `engine::Projector` and is built by
//! `engine::ProjectorFactory` from one `Projection`.

mod eval;
mod fetch;
mod filter;
mod grouping;
mod merge_count;
mod sort;
mod sys_update;
mod topn;
mod writer;

pub use eval::EvalProjector;
pub use fetch::{fetch_id, reader_id, FetchProjector, FetchSources};
pub use filter::FilterProjector;
pub use grouping::{AggregationProjector, GroupProjector};
pub use merge_count::MergeCountProjector;
pub use sort::{OrderingByPosition, SortingProjector};
pub use sys_update::{single_relation, SysUpdateProjector};
pub use topn::{OrderedTopNProjector, SimpleTopNProjector};
pub use writer::{resolve_target, RecordShape, WriterProjector};
