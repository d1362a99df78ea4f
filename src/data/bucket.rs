//! Finite row collections
//!
//! A bucket knows its size and hands out a single-pass cursor. Cursors
//! lend rows: the row returned by `next_row` is valid until the next call.
//! `SharedRowBucket` is not restartable: once drained, a second cursor
//! yields nothing. Call `materialize` first if the rows are needed twice.

use super::row::{Row, RowN, SharedRow};
use super::value::Value;

/// Lending, single-pass row cursor
pub trait RowCursor: Send {
    /// Advances to the next row. The returned view is invalidated by the
    /// following call.
    fn next_row(&mut self) -> Option<&dyn Row>;
}

/// Finite collection of rows with a known size
pub trait Bucket: Send {
    /// Number of rows in the bucket
    fn size(&self) -> usize;

    /// Starts a pass over the rows
    fn cursor(&mut self) -> Box<dyn RowCursor + '_>;
}

/// Bucket of fully materialized, independent rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayBucket {
    rows: Vec<RowN>,
}

impl ArrayBucket {
    pub fn new(rows: Vec<RowN>) -> Self {
        Self { rows }
    }

    /// Builds a bucket from raw cell vectors
    pub fn from_cells(rows: Vec<Vec<Value>>) -> Self {
        Self {
            rows: rows.into_iter().map(RowN::new).collect(),
        }
    }

    pub fn rows(&self) -> &[RowN] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<RowN> {
        self.rows
    }

    /// Rows as plain cell vectors
    pub fn to_cells(&self) -> Vec<Vec<Value>> {
        self.rows.iter().map(|r| r.cells().to_vec()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct ArrayCursor<'a> {
    rows: std::slice::Iter<'a, RowN>,
}

impl RowCursor for ArrayCursor<'_> {
    fn next_row(&mut self) -> Option<&dyn Row> {
        self.rows.next().map(|r| r as &dyn Row)
    }
}

impl Bucket for ArrayBucket {
    fn size(&self) -> usize {
        self.rows.len()
    }

    fn cursor(&mut self) -> Box<dyn RowCursor + '_> {
        Box::new(ArrayCursor {
            rows: self.rows.iter(),
        })
    }
}

/// Bucket backed by a one-shot row source and a single reused buffer
pub struct SharedRowBucket {
    source: Box<dyn Iterator<Item = Vec<Value>> + Send>,
    size: usize,
    buffer: SharedRow,
}

impl SharedRowBucket {
    /// Creates a bucket over `rows`; the buffer is sized for `num_columns`
    pub fn new(rows: Vec<Vec<Value>>, num_columns: usize) -> Self {
        let size = rows.len();
        Self {
            source: Box::new(rows.into_iter()),
            size,
            buffer: SharedRow::with_width(num_columns),
        }
    }

    /// Drains the remaining rows into independent copies.
    pub fn materialize(mut self) -> ArrayBucket {
        ArrayBucket::new(self.source.by_ref().map(RowN::new).collect())
    }
}

struct SharedCursor<'a> {
    source: &'a mut (dyn Iterator<Item = Vec<Value>> + Send),
    buffer: &'a mut SharedRow,
}

impl RowCursor for SharedCursor<'_> {
    fn next_row(&mut self) -> Option<&dyn Row> {
        let cells = self.source.next()?;
        self.buffer.load(cells);
        Some(&*self.buffer)
    }
}

impl Bucket for SharedRowBucket {
    fn size(&self) -> usize {
        self.size
    }

    fn cursor(&mut self) -> Box<dyn RowCursor + '_> {
        Box::new(SharedCursor {
            source: self.source.as_mut(),
            buffer: &mut self.buffer,
        })
    }
}
