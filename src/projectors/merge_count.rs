//! Sums row counts reported by upstream write stages

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::data::{Row, Value};
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};

/// Emits one row `[total]`, the sum of the first column of every input row
pub struct MergeCountProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    total: i64,
}

impl MergeCountProjector {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new("merge_count"),
            downstream: Downstream::default(),
            total: 0,
        }
    }
}

impl Default for MergeCountProjector {
    fn default() -> Self {
        Self::new()
    }
}

impl RowReceiver for MergeCountProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            if row.num_columns() == 0 {
                return Err(ExecutionError::evaluation("merge_count received an empty row"));
            }
            match row.get(0) {
                Value::Null => {}
                value => {
                    let count = value.as_i64().ok_or_else(|| {
                        ExecutionError::evaluation(format!(
                            "merge_count expects a numeric count, got {}",
                            value.type_name()
                        ))
                    })?;
                    self.total = self
                        .total
                        .checked_add(count)
                        .ok_or_else(|| ExecutionError::evaluation("row count overflow"))?;
                }
            }
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let row = vec![Value::Long(self.total)];
            self.downstream.push(&row).await?;
            self.downstream.finish().await
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            if self.lifecycle.on_fail() {
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for MergeCountProjector {
    fn kind(&self) -> &'static str {
        "merge_count"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
