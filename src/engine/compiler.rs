//! Projection to projector compilation
//!
//! `ProjectorFactory` is the single place that knows how each projection
//! kind becomes a stage. All parameter validation happens here, before
//! any row flows: a chain either compiles completely or not at all.

use std::collections::HashMap;
use std::sync::Arc;

use super::context::ExecutionContext;
use super::errors::{ExecResult, ExecutionError};
use super::projector::Projector;
use super::ram::StageMemory;
use super::services::ClusterServices;
use crate::aggregation::AggregationContext;
use crate::config::ExecutionSettings;
use crate::expression::{InputFactory, InputRow, Symbol};
use crate::indexing::{IndexWriterProjector, ShardDmlProjector};
use crate::observability::{log_event, Event};
use crate::projection::{FetchProjection, OrderedTopNProjection, Projection, WriterProjection};
use crate::projectors::{
    resolve_target, single_relation, AggregationProjector, EvalProjector, FetchProjector,
    FetchSources, FilterProjector, GroupProjector, MergeCountProjector, OrderedTopNProjector,
    OrderingByPosition, SimpleTopNProjector, SortingProjector, SysUpdateProjector,
    WriterProjector,
};

/// Builds projectors from projections
pub struct ProjectorFactory {
    services: ClusterServices,
    settings: ExecutionSettings,
}

impl ProjectorFactory {
    pub fn new(services: ClusterServices, settings: ExecutionSettings) -> Self {
        Self { services, settings }
    }

    pub fn services(&self) -> &ClusterServices {
        &self.services
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Compiles one projection for the job described by `ctx`
    pub fn compile(
        &self,
        projection: &Projection,
        ctx: &ExecutionContext,
    ) -> ExecResult<Box<dyn Projector>> {
        let projector: Box<dyn Projector> = match projection {
            Projection::OrderedTopN(p) => self.ordered_top_n(p, ctx)?,
            Projection::TopN(p) => {
                if p.limit == 0 {
                    return Err(ExecutionError::invalid_parameter("top_n limit must be > 0"));
                }
                Box::new(SimpleTopNProjector::new(p.limit, p.offset))
            }
            Projection::Eval(p) => Box::new(EvalProjector::new(InputRow::compile(&p.outputs)?)),
            Projection::Filter(p) => Box::new(FilterProjector::new(InputFactory::compile(&p.query)?)),
            Projection::Group(p) => {
                let keys = InputRow::compile(&p.keys)?;
                let aggregations = AggregationContext::compile_all(&p.values, p.mode)?;
                Box::new(GroupProjector::new(
                    keys,
                    aggregations,
                    StageMemory::new(ctx.ram.clone()),
                ))
            }
            Projection::Aggregation(p) => Box::new(AggregationProjector::new(
                AggregationContext::compile_all(&p.aggregations, p.mode)?,
            )),
            Projection::MergeCount => Box::new(MergeCountProjector::new()),
            Projection::Writer(p) => self.writer(p, ctx)?,
            Projection::SourceIndexWriter(p) => Box::new(IndexWriterProjector::for_source(
                p,
                self.services.clone(),
                &self.settings,
                ctx.job_id,
            )?),
            Projection::ColumnIndexWriter(p) => Box::new(IndexWriterProjector::for_columns(
                p,
                self.services.clone(),
                &self.settings,
                ctx.job_id,
            )?),
            Projection::Update(p) => {
                let shard = ctx
                    .shard_id
                    .clone()
                    .ok_or(ExecutionError::ShardIdentityMissing("Update"))?;
                Box::new(ShardDmlProjector::update(
                    p,
                    shard,
                    self.services.clone(),
                    &self.settings,
                    ctx.job_id,
                )?)
            }
            Projection::Delete(p) => {
                let shard = ctx
                    .shard_id
                    .clone()
                    .ok_or(ExecutionError::ShardIdentityMissing("Delete"))?;
                Box::new(ShardDmlProjector::delete(
                    p,
                    shard,
                    self.services.clone(),
                    &self.settings,
                    ctx.job_id,
                )?)
            }
            Projection::Fetch(p) => self.fetch(p, ctx)?,
            Projection::SysUpdate(p) => {
                let relation = single_relation(&p.assignments)?;
                let updater = self
                    .services
                    .sys_updaters
                    .get(relation)
                    .ok_or_else(|| ExecutionError::UnknownRelation(relation.to_string()))?;
                let assignments = p
                    .assignments
                    .iter()
                    .map(|a| Ok((a.column.clone(), InputFactory::compile(&a.value)?)))
                    .collect::<ExecResult<Vec<_>>>()?;
                Box::new(SysUpdateProjector::new(
                    InputFactory::compile(&p.key)?,
                    updater,
                    assignments,
                ))
            }
        };

        self.services.metrics.increment_stages_compiled();
        log_event(
            Event::StageCompiled,
            &[
                ("job_id", ctx.job_id.to_string().as_str()),
                ("stage", projector.kind()),
            ],
        );
        Ok(projector)
    }

    /// Compiles a whole chain, head first
    pub fn compile_all(
        &self,
        projections: &[Projection],
        ctx: &ExecutionContext,
    ) -> ExecResult<Vec<Box<dyn Projector>>> {
        projections.iter().map(|p| self.compile(p, ctx)).collect()
    }

    fn ordered_top_n(
        &self,
        p: &OrderedTopNProjection,
        ctx: &ExecutionContext,
    ) -> ExecResult<Box<dyn Projector>> {
        if p.order_by.is_empty() {
            return Err(ExecutionError::invalid_parameter(
                "ordered_top_n requires at least one order_by symbol",
            ));
        }
        // Outputs first, then the sort keys; the comparator reads the tail.
        let num_outputs = p.outputs.len();
        let symbols: Vec<Symbol> = p.outputs.iter().chain(&p.order_by).cloned().collect();
        let input_row = InputRow::compile(&symbols)?;
        let indices = (num_outputs..num_outputs + p.order_by.len()).collect();
        let ordering = Arc::new(OrderingByPosition::new(
            indices,
            &p.reverse_flags,
            &p.nulls_first,
        )?);
        let memory = StageMemory::new(ctx.ram.clone());

        Ok(match p.limit {
            Some(0) => {
                return Err(ExecutionError::invalid_parameter(
                    "ordered_top_n limit must be > 0",
                ))
            }
            Some(limit) => Box::new(OrderedTopNProjector::new(
                input_row,
                ordering,
                num_outputs,
                limit,
                p.offset,
                memory,
            )),
            None => Box::new(SortingProjector::new(
                input_row,
                ordering,
                num_outputs,
                p.offset,
                memory,
            )),
        })
    }

    fn writer(&self, p: &WriterProjection, ctx: &ExecutionContext) -> ExecResult<Box<dyn Projector>> {
        let path = resolve_target(&p.uri, ctx, p.compression)?;
        let columns = if p.inputs.is_empty() {
            None
        } else {
            Some(InputRow::compile(&p.inputs)?)
        };
        let shape = WriterProjector::shape_for(p.output_format, columns, p.output_names.clone())?;
        Ok(Box::new(WriterProjector::new(
            path,
            p.compression,
            shape,
            p.overwrites.clone(),
            self.services.metrics.clone(),
        )))
    }

    fn fetch(&self, p: &FetchProjection, ctx: &ExecutionContext) -> ExecResult<Box<dyn Projector>> {
        let fetch_size = p.fetch_size.unwrap_or(self.settings.fetch_size);
        if fetch_size == 0 {
            return Err(ExecutionError::invalid_parameter("fetch_size must be > 0"));
        }
        let reader_nodes: HashMap<u32, String> = p
            .readers
            .iter()
            .map(|r| (r.reader_id, r.node.clone()))
            .collect();
        let sources = FetchSources {
            transport: self.services.fetch.clone(),
            job_id: ctx.job_id,
            failures: ctx.failures.clone(),
            metrics: self.services.metrics.clone(),
        };
        Ok(Box::new(FetchProjector::new(
            p.fetch_id,
            p.columns.clone(),
            reader_nodes,
            fetch_size,
            sources,
            StageMemory::new(ctx.ram.clone()),
        )))
    }

    /// Factory over a fresh single-node in-memory cluster
    #[cfg(test)]
    pub fn local_for_tests() -> Self {
        let cluster = Arc::new(crate::cluster::local::LocalCluster::new(1, 1));
        Self::new(ClusterServices::local(cluster), ExecutionSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ShardId;
    use crate::expression::Symbol;
    use crate::projection::{
        DeleteProjection, SysAssignment, SysUpdateProjection, TopNProjection, UpdateProjection,
    };
    use std::collections::BTreeMap;

    fn ctx() -> ExecutionContext {
        ExecutionContext::for_job(&ExecutionSettings::default())
    }

    #[test]
    fn test_every_kind_has_a_stage() {
        let factory = ProjectorFactory::local_for_tests();
        let projector = factory
            .compile(&Projection::TopN(TopNProjection { limit: 3, offset: 0 }), &ctx())
            .unwrap();
        assert_eq!(projector.kind(), "top_n");
        let projector = factory.compile(&Projection::MergeCount, &ctx()).unwrap();
        assert_eq!(projector.kind(), "merge_count");
        assert_eq!(factory.services().metrics.snapshot().stages_compiled, 2);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let factory = ProjectorFactory::local_for_tests();
        let err = factory
            .compile(&Projection::TopN(TopNProjection { limit: 0, offset: 0 }), &ctx())
            .err()
            .unwrap();
        assert!(matches!(err, ExecutionError::InvalidParameter(_)));

        let ordered = OrderedTopNProjection {
            outputs: vec![Symbol::input(0)],
            order_by: vec![Symbol::input(0)],
            reverse_flags: vec![],
            nulls_first: vec![],
            limit: Some(0),
            offset: 0,
        };
        assert!(factory.compile(&Projection::OrderedTopN(ordered), &ctx()).is_err());
    }

    #[test]
    fn test_update_and_delete_require_shard() {
        let factory = ProjectorFactory::local_for_tests();
        let update = Projection::Update(UpdateProjection {
            uid: Symbol::input(0),
            assignments: BTreeMap::from([("a".to_string(), Symbol::literal(1i64))]),
            required_version: None,
            bulk_actions: None,
        });
        let delete = Projection::Delete(DeleteProjection {
            uid: Symbol::input(0),
            bulk_actions: None,
        });

        assert_eq!(
            factory.compile(&update, &ctx()).err().unwrap(),
            ExecutionError::ShardIdentityMissing("Update")
        );
        assert_eq!(
            factory.compile(&delete, &ctx()).err().unwrap(),
            ExecutionError::ShardIdentityMissing("Delete")
        );

        let on_shard = ctx().with_shard(ShardId::new("t", 0));
        assert_eq!(factory.compile(&delete, &on_shard).unwrap().kind(), "delete");
    }

    #[test]
    fn test_sys_update_relation_checks() {
        let factory = ProjectorFactory::local_for_tests();
        let assignment = |relation: &str| SysAssignment {
            relation: relation.into(),
            column: "c".into(),
            value: Symbol::literal(1i64),
        };
        let mixed = Projection::SysUpdate(SysUpdateProjection {
            key: Symbol::input(0),
            assignments: vec![assignment("sys.nodes"), assignment("sys.jobs")],
        });
        assert!(matches!(
            factory.compile(&mixed, &ctx()).err().unwrap(),
            ExecutionError::MixedTableAssignment { .. }
        ));

        let unknown = Projection::SysUpdate(SysUpdateProjection {
            key: Symbol::input(0),
            assignments: vec![assignment("sys.nodes")],
        });
        assert_eq!(
            factory.compile(&unknown, &ctx()).err().unwrap(),
            ExecutionError::UnknownRelation("sys.nodes".into())
        );
    }
}
