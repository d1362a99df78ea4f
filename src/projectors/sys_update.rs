//! System-table update

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::cluster::SysRowUpdater;
use crate::data::{Row, Value};
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};
use crate::expression::Input;
use crate::projection::SysAssignment;

/// Returns the one relation every assignment targets
pub fn single_relation(assignments: &[SysAssignment]) -> ExecResult<&str> {
    let first = assignments
        .first()
        .ok_or_else(|| ExecutionError::invalid_parameter("sys update without assignments"))?;
    if let Some(other) = assignments.iter().find(|a| a.relation != first.relation) {
        return Err(ExecutionError::MixedTableAssignment {
            first: first.relation.clone(),
            second: other.relation.clone(),
        });
    }
    Ok(&first.relation)
}

/// Applies assignments to the row identified by `key`; emits `[updated]`
pub struct SysUpdateProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    key: Box<dyn Input>,
    updater: Arc<dyn SysRowUpdater>,
    assignments: Vec<(String, Box<dyn Input>)>,
    updated: i64,
}

impl SysUpdateProjector {
    pub fn new(
        key: Box<dyn Input>,
        updater: Arc<dyn SysRowUpdater>,
        assignments: Vec<(String, Box<dyn Input>)>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("sys_update"),
            downstream: Downstream::default(),
            key,
            updater,
            assignments,
            updated: 0,
        }
    }
}

impl RowReceiver for SysUpdateProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let key = self.key.value(row)?;
            let values = self
                .assignments
                .iter()
                .map(|(column, input)| Ok((column.clone(), input.value(row)?)))
                .collect::<ExecResult<Vec<_>>>()?;
            if self.updater.update_row(&key, &values)? {
                self.updated += 1;
            }
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let row = vec![Value::Long(self.updated)];
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

impl Projector for SysUpdateProjector {
    fn kind(&self) -> &'static str {
        "sys_update"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
