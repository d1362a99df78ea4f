//! Ordering and unbounded sort

use std::cmp::Ordering;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::data::{Row, Value};
use crate::engine::ram::StageMemory;
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};
use crate::expression::InputRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SortColumn {
    index: usize,
    reverse: bool,
    nulls_first: bool,
}

/// Comparator over positional columns.
///
/// Columns are compared left to right. `reverse` flips the value order of
/// a column but not the null placement: nulls go first or last purely by
/// `nulls_first`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderingByPosition {
    columns: Vec<SortColumn>,
}

impl OrderingByPosition {
    /// `reverse_flags` and `nulls_first` may be empty (ascending; nulls
    /// last when ascending, first when descending) or match `indices`.
    pub fn new(indices: Vec<usize>, reverse_flags: &[bool], nulls_first: &[bool]) -> ExecResult<Self> {
        check_flags("reverse_flags", reverse_flags, indices.len())?;
        check_flags("nulls_first", nulls_first, indices.len())?;
        let columns = indices
            .into_iter()
            .enumerate()
            .map(|(i, index)| {
                let reverse = reverse_flags.get(i).copied().unwrap_or(false);
                SortColumn {
                    index,
                    reverse,
                    nulls_first: nulls_first.get(i).copied().unwrap_or(reverse),
                }
            })
            .collect();
        Ok(Self { columns })
    }

    pub fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
        for column in &self.columns {
            let (x, y) = (&a[column.index], &b[column.index]);
            let ord = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) if column.nulls_first => Ordering::Less,
                (true, false) => Ordering::Greater,
                (false, true) if column.nulls_first => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) if column.reverse => y.total_cmp(x),
                (false, false) => x.total_cmp(y),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn check_flags(name: &str, flags: &[bool], expected: usize) -> ExecResult<()> {
    if !flags.is_empty() && flags.len() != expected {
        return Err(ExecutionError::invalid_parameter(format!(
            "{} has {} entries for {} order-by column(s)",
            name,
            flags.len(),
            expected
        )));
    }
    Ok(())
}

/// Buffers every row, sorts stably, skips `offset`.
///
/// Rows are evaluated as `outputs ++ order_by`; only the first
/// `num_outputs` columns are emitted.
pub struct SortingProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    input_row: InputRow,
    ordering: Arc<OrderingByPosition>,
    num_outputs: usize,
    offset: usize,
    memory: StageMemory,
    rows: Vec<Vec<Value>>,
}

impl SortingProjector {
    pub fn new(
        input_row: InputRow,
        ordering: Arc<OrderingByPosition>,
        num_outputs: usize,
        offset: usize,
        memory: StageMemory,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("ordered_top_n"),
            downstream: Downstream::default(),
            input_row,
            ordering,
            num_outputs,
            offset,
            memory,
            rows: Vec::new(),
        }
    }
}

impl RowReceiver for SortingProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let cells = self.input_row.evaluate_owned(row)?;
            self.memory.charge(cells.estimated_size())?;
            self.rows.push(cells);
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let mut rows = std::mem::take(&mut self.rows);
            let ordering = self.ordering.clone();
            rows.sort_by(|a, b| ordering.compare(a, b));
            let num_outputs = self.num_outputs;
            let emitted = rows.into_iter().skip(self.offset).map(move |mut cells| {
                cells.truncate(num_outputs);
                cells
            });
            let result = self.downstream.push_all(emitted).await;
            self.memory.release_all();
            result?;
            self.downstream.finish().await
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            if self.lifecycle.on_fail() {
                self.rows.clear();
                self.memory.release_all();
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for SortingProjector {
    fn kind(&self) -> &'static str {
        "ordered_top_n"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
