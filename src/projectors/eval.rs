//! 1:1 row transform

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::data::Row;
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};
use crate::expression::InputRow;

/// Replaces every row with its evaluated outputs
pub struct EvalProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    outputs: InputRow,
}

impl EvalProjector {
    pub fn new(outputs: InputRow) -> Self {
        Self {
            lifecycle: Lifecycle::new("eval"),
            downstream: Downstream::default(),
            outputs,
        }
    }
}

impl RowReceiver for EvalProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let evaluated = self.outputs.evaluate(row)?;
            self.downstream.push(evaluated).await
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
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

impl Projector for EvalProjector {
    fn kind(&self) -> &'static str {
        "eval"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
