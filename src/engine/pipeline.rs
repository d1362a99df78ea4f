//! Projector chains
//!
//! A chain is a list of compiled projectors wired head to tail, ending in
//! a terminal receiver. The driver pushes the rows of a bucket into the
//! head, honors `Stop`, then signals `finish`, or `fail` on the first
//! error.

use super::compiler::ProjectorFactory;
use super::context::ExecutionContext;
use super::errors::ExecResult;
use super::projector::{Projector, RowCollector, RowFlow, RowReceiver};
use crate::data::{Bucket, Value};
use crate::observability::{log_event, Event};
use crate::projection::Projection;

/// Wired chain of projectors
pub struct ProjectorChain {
    head: Box<dyn RowReceiver>,
    kinds: Vec<&'static str>,
}

impl ProjectorChain {
    /// Wires `projectors` in order and appends `terminal`
    pub fn new(projectors: Vec<Box<dyn Projector>>, terminal: Box<dyn RowReceiver>) -> Self {
        let kinds = projectors.iter().map(|p| p.kind()).collect();
        let mut head = terminal;
        for mut projector in projectors.into_iter().rev() {
            projector.set_downstream(head);
            head = Box::new(projector);
        }
        Self { head, kinds }
    }

    /// Kind tags of the stages, head first
    pub fn kinds(&self) -> &[&'static str] {
        &self.kinds
    }

    /// Drives every row of `bucket` through the chain
    pub async fn run(mut self, bucket: &mut dyn Bucket) -> ExecResult<()> {
        let mut cursor = bucket.cursor();
        while let Some(row) = cursor.next_row() {
            match self.head.take_row(row).await {
                Ok(RowFlow::Continue) => {}
                Ok(RowFlow::Stop) => break,
                Err(error) => return self.abort(error).await,
            }
        }
        drop(cursor);

        match self.head.finish().await {
            Ok(()) => Ok(()),
            Err(error) => self.abort(error).await,
        }
    }

    async fn abort(&mut self, error: super::errors::ExecutionError) -> ExecResult<()> {
        log_event(
            Event::StageFailed,
            &[
                ("code", error.code()),
                ("error", error.to_string().as_str()),
                ("stages", self.kinds.join(",").as_str()),
            ],
        );
        self.head.fail(error.clone()).await;
        Err(error)
    }
}

/// Compiles `projections`, runs `bucket` through them and returns the
/// rows reaching the end of the chain
pub async fn execute(
    factory: &ProjectorFactory,
    projections: &[Projection],
    ctx: &ExecutionContext,
    bucket: &mut dyn Bucket,
) -> ExecResult<Vec<Vec<Value>>> {
    let projectors = factory.compile_all(projections, ctx)?;
    let (collector, handle) = RowCollector::new();
    let chain = ProjectorChain::new(projectors, Box::new(collector));
    let stages = chain.kinds().join(",");

    let outcome = chain.run(bucket).await;
    let rows = handle.result().await;
    outcome?;
    let rows = rows?;

    log_event(
        Event::StageFinished,
        &[
            ("elapsed_ms", ctx.elapsed_ms().to_string().as_str()),
            ("job_id", ctx.job_id.to_string().as_str()),
            ("rows", rows.len().to_string().as_str()),
            ("stages", stages.as_str()),
        ],
    );
    Ok(rows)
}
