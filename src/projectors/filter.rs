//! Row filter

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::data::{Row, Value};
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};
use crate::expression::Input;

/// Forwards rows whose predicate is `true`; NULL and false drop the row
pub struct FilterProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    predicate: Box<dyn Input>,
}

impl FilterProjector {
    pub fn new(predicate: Box<dyn Input>) -> Self {
        Self {
            lifecycle: Lifecycle::new("filter"),
            downstream: Downstream::default(),
            predicate,
        }
    }
}

impl RowReceiver for FilterProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            match self.predicate.value(row)? {
                Value::Bool(true) => self.downstream.push(row).await,
                Value::Bool(false) | Value::Null => Ok(RowFlow::Continue),
                other => Err(ExecutionError::evaluation(format!(
                    "filter predicate returned {}, expected boolean",
                    other.type_name()
                ))),
            }
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

impl Projector for FilterProjector {
    fn kind(&self) -> &'static str {
        "filter"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
