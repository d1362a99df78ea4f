//! Bounded TopN stages

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::sort::OrderingByPosition;
use crate::data::{Row, Value};
use crate::engine::ram::StageMemory;
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};
use crate::expression::InputRow;

/// Heap entry ordered by the row comparator, then by arrival.
///
/// The heap is a max-heap, so its top is the entry that sorts last: the
/// first candidate for eviction.
struct Candidate {
    cells: Vec<Value>,
    seq: u64,
    size: usize,
    ordering: Arc<OrderingByPosition>,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering
            .compare(&self.cells, &other.cells)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Keeps the best `limit + offset` rows in a bounded heap
pub struct OrderedTopNProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    input_row: InputRow,
    ordering: Arc<OrderingByPosition>,
    num_outputs: usize,
    limit: usize,
    offset: usize,
    memory: StageMemory,
    heap: BinaryHeap<Candidate>,
    seq: u64,
}

impl OrderedTopNProjector {
    pub fn new(
        input_row: InputRow,
        ordering: Arc<OrderingByPosition>,
        num_outputs: usize,
        limit: usize,
        offset: usize,
        memory: StageMemory,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("ordered_top_n"),
            downstream: Downstream::default(),
            input_row,
            ordering,
            num_outputs,
            limit,
            offset,
            memory,
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.limit.saturating_add(self.offset)
    }

    fn offer(&mut self, cells: Vec<Value>) -> ExecResult<()> {
        let seq = self.seq;
        self.seq += 1;

        if self.heap.len() >= self.capacity() {
            let Some(worst) = self.heap.peek() else {
                return Ok(());
            };
            // later arrival loses ties, so only strictly better rows enter
            if self.ordering.compare(&cells, &worst.cells) != Ordering::Less {
                return Ok(());
            }
            if let Some(evicted) = self.heap.pop() {
                self.memory.release(evicted.size);
            }
        }

        let size = cells.estimated_size();
        self.memory.charge(size)?;
        self.heap.push(Candidate {
            cells,
            seq,
            size,
            ordering: self.ordering.clone(),
        });
        Ok(())
    }
}

impl RowReceiver for OrderedTopNProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let cells = self.input_row.evaluate_owned(row)?;
            self.offer(cells)?;
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let sorted = std::mem::take(&mut self.heap).into_sorted_vec();
            let num_outputs = self.num_outputs;
            let emitted = sorted
                .into_iter()
                .skip(self.offset)
                .take(self.limit)
                .map(move |candidate| {
                    let mut cells = candidate.cells;
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
                self.heap.clear();
                self.memory.release_all();
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for OrderedTopNProjector {
    fn kind(&self) -> &'static str {
        "ordered_top_n"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}

/// Unordered limit/offset: forwards rows `[offset, offset + limit)` in
/// arrival order and stops upstream once `limit` rows went out.
pub struct SimpleTopNProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    to_skip: usize,
    remaining: usize,
}

impl SimpleTopNProjector {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            lifecycle: Lifecycle::new("top_n"),
            downstream: Downstream::default(),
            to_skip: offset,
            remaining: limit,
        }
    }
}

impl RowReceiver for SimpleTopNProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            if self.to_skip > 0 {
                self.to_skip -= 1;
                return Ok(RowFlow::Continue);
            }
            if self.remaining == 0 {
                return Ok(RowFlow::Stop);
            }
            self.remaining -= 1;
            let flow = self.downstream.push(row).await?;
            if self.remaining == 0 {
                Ok(RowFlow::Stop)
            } else {
                Ok(flow)
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

impl Projector for SimpleTopNProjector {
    fn kind(&self) -> &'static str {
        "top_n"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}
