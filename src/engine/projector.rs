//! Push-based operator contract
//!
//! Every stage receives rows through `take_row`, then exactly one of
//! `finish` or `fail`. Rows are borrowed for the duration of the call only;
//! a stage that keeps a row must materialize it.
//!
//! State machine: `Created -> Running -> (Completed | Failed)`.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;

use super::errors::{ExecResult, ExecutionError};
use crate::data::{Row, Value};

/// Flow control returned from `take_row`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFlow {
    Continue,
    /// Upstream must stop delivering rows and call `finish`
    Stop,
}

/// Anything rows can be pushed into
pub trait RowReceiver: Send {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>>;

    /// Upstream is exhausted; flush and signal downstream
    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>>;

    /// Upstream failed; clean up and propagate downstream
    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()>;
}

/// A compiled stage
pub trait Projector: RowReceiver {
    /// Kind tag of the projection this stage was compiled from
    fn kind(&self) -> &'static str;

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>);
}

impl RowReceiver for Box<dyn Projector> {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        (**self).take_row(row)
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        (**self).finish()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        (**self).fail(error)
    }
}

/// Lifecycle state of a projector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorState {
    Created,
    Running,
    Completed,
    Failed,
}

/// State machine shared by all projectors
#[derive(Debug)]
pub struct Lifecycle {
    kind: &'static str,
    state: ProjectorState,
}

impl Lifecycle {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            state: ProjectorState::Created,
        }
    }

    pub fn state(&self) -> ProjectorState {
        self.state
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, ProjectorState::Completed | ProjectorState::Failed)
    }

    /// Accepts a row. Rows after `finish` or `fail` are a contract violation.
    pub fn on_row(&mut self) -> ExecResult<()> {
        if self.is_terminal() {
            return Err(ExecutionError::InvalidState(format!(
                "{} received a row after reaching {:?}",
                self.kind, self.state
            )));
        }
        self.state = ProjectorState::Running;
        Ok(())
    }

    pub fn on_finish(&mut self) -> ExecResult<()> {
        if self.is_terminal() {
            return Err(ExecutionError::InvalidState(format!(
                "{} finished twice (state {:?})",
                self.kind, self.state
            )));
        }
        self.state = ProjectorState::Completed;
        Ok(())
    }

    /// Returns false if the failure was already handled
    pub fn on_fail(&mut self) -> bool {
        if self.state == ProjectorState::Failed {
            return false;
        }
        self.state = ProjectorState::Failed;
        true
    }
}

/// Downstream slot of a projector
#[derive(Default)]
pub struct Downstream {
    inner: Option<Box<dyn RowReceiver>>,
}

impl Downstream {
    pub fn set(&mut self, downstream: Box<dyn RowReceiver>) {
        self.inner = Some(downstream);
    }

    fn get(&mut self) -> ExecResult<&mut Box<dyn RowReceiver>> {
        self.inner
            .as_mut()
            .ok_or_else(|| ExecutionError::InvalidState("projector has no downstream".to_string()))
    }

    pub async fn push(&mut self, row: &dyn Row) -> ExecResult<RowFlow> {
        self.get()?.take_row(row).await
    }

    /// Pushes owned rows until downstream asks to stop
    pub async fn push_all<I>(&mut self, rows: I) -> ExecResult<()>
    where
        I: IntoIterator<Item = Vec<Value>> + Send,
        I::IntoIter: Send,
    {
        let downstream = self.get()?;
        for row in rows {
            if downstream.take_row(&row).await? == RowFlow::Stop {
                break;
            }
        }
        Ok(())
    }

    pub async fn finish(&mut self) -> ExecResult<()> {
        self.get()?.finish().await
    }

    pub async fn fail(&mut self, error: ExecutionError) {
        if let Some(downstream) = self.inner.as_mut() {
            downstream.fail(error).await;
        }
    }
}

/// Terminal receiver that collects materialized rows
pub struct RowCollector {
    rows: Vec<Vec<Value>>,
    sender: Option<oneshot::Sender<ExecResult<Vec<Vec<Value>>>>>,
}

/// Completion side of a `RowCollector`
pub struct CollectorHandle {
    receiver: oneshot::Receiver<ExecResult<Vec<Vec<Value>>>>,
}

impl RowCollector {
    pub fn new() -> (Self, CollectorHandle) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                rows: Vec::new(),
                sender: Some(sender),
            },
            CollectorHandle { receiver },
        )
    }

    fn complete(&mut self, result: ExecResult<Vec<Vec<Value>>>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
    }
}

impl RowReceiver for RowCollector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            if self.sender.is_none() {
                return Err(ExecutionError::InvalidState(
                    "collector received a row after completion".to_string(),
                ));
            }
            self.rows.push(row.materialize());
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            let rows = std::mem::take(&mut self.rows);
            self.complete(Ok(rows));
            Ok(())
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            self.rows.clear();
            self.complete(Err(error));
        }
        .boxed()
    }
}

impl CollectorHandle {
    /// Waits for the chain to complete. A collector dropped without
    /// completion yields `Cancelled`.
    pub async fn result(self) -> ExecResult<Vec<Vec<Value>>> {
        self.receiver.await.unwrap_or(Err(ExecutionError::Cancelled))
    }
}
