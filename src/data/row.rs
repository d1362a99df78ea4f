//! Row representations
//!
//! A row is a positional, fixed-width sequence of values. Stages receive
//! rows as `&dyn Row`, a view that is only valid for the duration of the
//! call that delivered it: producers are free to reuse the backing buffer
//! for the next row (`SharedRow`). A stage that needs a row past that call
//! must `materialize()` it into an owned `RowN`.

use super::value::Value;

/// Positional row view
pub trait Row: Send + Sync {
    /// Number of columns in this row
    fn num_columns(&self) -> usize;

    /// Value at the given column position.
    ///
    /// Panics if `index >= num_columns()`; stage compilers validate
    /// column references up front.
    fn get(&self, index: usize) -> &Value;

    /// Copies the row into owned cells.
    fn materialize(&self) -> Vec<Value> {
        (0..self.num_columns()).map(|i| self.get(i).clone()).collect()
    }

    /// Estimated footprint of a materialized copy of this row
    fn estimated_size(&self) -> usize {
        (0..self.num_columns())
            .map(|i| self.get(i).estimated_size())
            .sum()
    }
}

/// Owned, independent row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RowN {
    cells: Vec<Value>,
}

impl RowN {
    pub fn new(cells: Vec<Value>) -> Self {
        Self { cells }
    }

    /// The empty row (zero columns), used to evaluate constant symbols
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    pub fn into_cells(self) -> Vec<Value> {
        self.cells
    }
}

impl Row for RowN {
    fn num_columns(&self) -> usize {
        self.cells.len()
    }

    fn get(&self, index: usize) -> &Value {
        &self.cells[index]
    }

    fn materialize(&self) -> Vec<Value> {
        self.cells.clone()
    }
}

impl Row for Vec<Value> {
    fn num_columns(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> &Value {
        &self[index]
    }
}

impl From<Vec<Value>> for RowN {
    fn from(cells: Vec<Value>) -> Self {
        Self::new(cells)
    }
}

/// Reusable row buffer.
///
/// The buffer keeps its allocation between rows; `load` overwrites the
/// cells in place. Anything that was handed a `&dyn Row` pointing at this
/// buffer sees the new contents, which is why consumers never retain it.
#[derive(Debug, Default)]
pub struct SharedRow {
    cells: Vec<Value>,
}

impl SharedRow {
    pub fn with_width(width: usize) -> Self {
        Self {
            cells: Vec::with_capacity(width),
        }
    }

    /// Replaces the buffer contents with `values`.
    pub fn load<I: IntoIterator<Item = Value>>(&mut self, values: I) {
        self.cells.clear();
        self.cells.extend(values);
    }

    /// Mutable access for stages that fill the buffer cell by cell
    pub fn cells_mut(&mut self) -> &mut Vec<Value> {
        &mut self.cells
    }
}

impl Row for SharedRow {
    fn num_columns(&self) -> usize {
        self.cells.len()
    }

    fn get(&self, index: usize) -> &Value {
        &self.cells[index]
    }
}
