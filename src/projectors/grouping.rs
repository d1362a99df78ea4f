//! Grouping and global aggregation
//!
//! Group output order is hash order: it carries no meaning, and a sort
//! stage must follow if order matters.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::aggregation::{AggregateState, AggregationContext, STATE_SIZE};
use crate::data::{Row, Value};
use crate::engine::ram::StageMemory;
use crate::engine::{
    Downstream, ExecResult, ExecutionError, Lifecycle, Projector, RowFlow, RowReceiver,
};
use crate::expression::InputRow;

/// Accounting overhead of one hash map entry
const ENTRY_OVERHEAD: usize = 48;

/// Hash aggregation keyed by the full key tuple.
///
/// Emits `keys ++ aggregate values` per group.
pub struct GroupProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    keys: InputRow,
    aggregations: Vec<AggregationContext>,
    groups: HashMap<Vec<Value>, Vec<AggregateState>>,
    memory: StageMemory,
}

impl GroupProjector {
    pub fn new(keys: InputRow, aggregations: Vec<AggregationContext>, memory: StageMemory) -> Self {
        Self {
            lifecycle: Lifecycle::new("group"),
            downstream: Downstream::default(),
            keys,
            aggregations,
            groups: HashMap::new(),
            memory,
        }
    }

    fn accumulate(&mut self, row: &dyn Row) -> ExecResult<()> {
        let key = self.keys.evaluate_owned(row)?;
        if !self.groups.contains_key(&key) {
            self.memory.charge(
                ENTRY_OVERHEAD + key.estimated_size() + STATE_SIZE * self.aggregations.len(),
            )?;
            let states = self.aggregations.iter().map(AggregationContext::new_state).collect();
            self.groups.insert(key.clone(), states);
        }
        if let Some(states) = self.groups.get_mut(&key) {
            for (aggregation, state) in self.aggregations.iter().zip(states.iter_mut()) {
                aggregation.accumulate(state, row)?;
            }
        }
        Ok(())
    }
}

impl RowReceiver for GroupProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            self.accumulate(row)?;
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let groups = std::mem::take(&mut self.groups);
            let rows: Vec<Vec<Value>> = groups
                .into_iter()
                .map(|(mut key, states)| {
                    key.extend(
                        self.aggregations
                            .iter()
                            .zip(states.iter())
                            .map(|(aggregation, state)| aggregation.terminate(state)),
                    );
                    key
                })
                .collect();
            let result = self.downstream.push_all(rows).await;
            self.memory.release_all();
            result?;
            self.downstream.finish().await
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            if self.lifecycle.on_fail() {
                self.groups.clear();
                self.memory.release_all();
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for GroupProjector {
    fn kind(&self) -> &'static str {
        "group"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}

/// Aggregation without keys: always exactly one output row
pub struct AggregationProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    aggregations: Vec<AggregationContext>,
    states: Vec<AggregateState>,
}

impl AggregationProjector {
    pub fn new(aggregations: Vec<AggregationContext>) -> Self {
        let states = aggregations.iter().map(AggregationContext::new_state).collect();
        Self {
            lifecycle: Lifecycle::new("aggregation"),
            downstream: Downstream::default(),
            aggregations,
            states,
        }
    }
}

impl RowReceiver for AggregationProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            for (aggregation, state) in self.aggregations.iter().zip(self.states.iter_mut()) {
                aggregation.accumulate(state, row)?;
            }
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            let row: Vec<Value> = self
                .aggregations
                .iter()
                .zip(self.states.iter())
                .map(|(aggregation, state)| aggregation.terminate(state))
                .collect();
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

impl Projector for AggregationProjector {
    fn kind(&self) -> &'static str {
        "aggregation"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{AggregateFunction, AggregateMode, Aggregation};
    use crate::engine::{RamAccountingContext, RowCollector};
    use crate::expression::Symbol;

    fn sum_and_count(mode: AggregateMode) -> Vec<AggregationContext> {
        AggregationContext::compile_all(
            &[
                Aggregation::new(AggregateFunction::Sum, vec![Symbol::input(1)]),
                Aggregation::count_star(),
            ],
            mode,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_group_sums_per_key() {
        let ram = RamAccountingContext::unlimited("test");
        let mut group = GroupProjector::new(
            InputRow::compile(&[Symbol::input(0)]).unwrap(),
            sum_and_count(AggregateMode::IterFinal),
            StageMemory::new(ram.clone()),
        );
        let (collector, handle) = RowCollector::new();
        group.set_downstream(Box::new(collector));

        for (k, v) in [("a", 1), ("b", 10), ("a", 2), ("a", 3), ("b", 20)] {
            group
                .take_row(&vec![Value::from(k), Value::Long(v)])
                .await
                .unwrap();
        }
        assert!(ram.used() > 0);
        group.finish().await.unwrap();

        let mut rows = handle.result().await.unwrap();
        rows.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert_eq!(
            rows,
            vec![
                vec![Value::from("a"), Value::Long(6), Value::Long(3)],
                vec![Value::from("b"), Value::Long(30), Value::Long(2)],
            ]
        );
        assert_eq!(ram.used(), 0);
    }

    #[tokio::test]
    async fn test_group_memory_limit_fails_stage() {
        let ram = RamAccountingContext::new("test", 100);
        let mut group = GroupProjector::new(
            InputRow::compile(&[Symbol::input(0)]).unwrap(),
            sum_and_count(AggregateMode::IterFinal),
            StageMemory::new(ram.clone()),
        );
        group.set_downstream(Box::new(RowCollector::new().0));
        let mut result = Ok(RowFlow::Continue);
        for i in 0..100i64 {
            result = group.take_row(&vec![Value::Long(i), Value::Long(i)]).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(ExecutionError::MemoryLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn test_global_aggregation_on_empty_input() {
        let mut agg = AggregationProjector::new(sum_and_count(AggregateMode::IterFinal));
        let (collector, handle) = RowCollector::new();
        agg.set_downstream(Box::new(collector));
        agg.finish().await.unwrap();
        assert_eq!(
            handle.result().await.unwrap(),
            vec![vec![Value::Null, Value::Long(0)]]
        );
    }

    #[tokio::test]
    async fn test_partial_then_final() {
        let mut partial = AggregationProjector::new(sum_and_count(AggregateMode::IterPartial));
        let (collector, handle) = RowCollector::new();
        partial.set_downstream(Box::new(collector));
        for v in [1i64, 2, 3] {
            partial.take_row(&vec![Value::Null, Value::Long(v)]).await.unwrap();
        }
        partial.finish().await.unwrap();
        let partial_row = handle.result().await.unwrap().remove(0);

        let final_aggs = AggregationContext::compile_all(
            &[
                Aggregation::new(AggregateFunction::Sum, vec![Symbol::input(0)]),
                Aggregation::new(AggregateFunction::CountStar, vec![Symbol::input(1)]),
            ],
            AggregateMode::PartialFinal,
        )
        .unwrap();
        let mut merge = AggregationProjector::new(final_aggs);
        let (collector, handle) = RowCollector::new();
        merge.set_downstream(Box::new(collector));
        merge.take_row(&partial_row).await.unwrap();
        merge.take_row(&partial_row).await.unwrap();
        merge.finish().await.unwrap();
        assert_eq!(
            handle.result().await.unwrap(),
            vec![vec![Value::Long(12), Value::Long(6)]]
        );
    }
}
