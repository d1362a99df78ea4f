//! Row & bucket model
//!
//! Values, positional rows (owned and shared-buffer views) and finite
//! row collections.

mod bucket;
mod row;
mod value;

pub use bucket::{ArrayBucket, Bucket, RowCursor, SharedRowBucket};
pub use row::{Row, RowN, SharedRow};
pub use value::Value;
