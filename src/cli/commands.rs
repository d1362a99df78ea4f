//! CLI command implementations
//!
//! Both commands run against an in-process `LocalCluster`. `run` pushes the
//! rows of a JSON file through the compiled plan; `validate` only compiles.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::cluster::local::LocalCluster;
use crate::cluster::ShardId;
use crate::config::ExecutionSettings;
use crate::data::{SharedRowBucket, Value};
use crate::engine::{execute, ClusterServices, ExecResult, ExecutionContext, ProjectorFactory};
use crate::observability::Logger;
use crate::projection::Projection;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_json_file, write_error, write_response};

/// Shape of the in-memory cluster a plan runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRun {
    pub nodes: usize,
    pub shards_per_index: u32,
    /// Indices created before the first row
    pub indices: Vec<String>,
    pub shard: Option<ShardId>,
}

impl Default for LocalRun {
    fn default() -> Self {
        Self {
            nodes: 1,
            shards_per_index: 1,
            indices: Vec::new(),
            shard: None,
        }
    }
}

/// Parse args and run the selected command, printing the JSON envelope
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    match run_command(cli.command) {
        Ok(data) => write_response(data),
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            Err(e)
        }
    }
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<JsonValue> {
    match cmd {
        Command::Run {
            plan,
            rows,
            config,
            shard,
            nodes,
            shards,
            indices,
        } => {
            let settings = load_settings(config.as_deref())?;
            let plan = load_plan(&plan)?;
            let rows = load_rows(&rows)?;
            if nodes == 0 || shards == 0 {
                return Err(CliError::invalid_argument("--nodes and --shards must be > 0"));
            }
            let local = LocalRun {
                nodes,
                shards_per_index: shards,
                indices,
                shard: parse_shard(shard.as_deref())?,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            Ok(runtime.block_on(run_plan(&plan, rows, settings, &local))?)
        }
        Command::Validate {
            plan,
            config,
            shard,
        } => {
            let settings = load_settings(config.as_deref())?;
            let plan = load_plan(&plan)?;
            let shard = parse_shard(shard.as_deref())?;
            let stages = validate_plan(&plan, settings, shard)?;
            Ok(json!({ "stages": stages }))
        }
    }
}

/// Executes `plan` over `rows` and returns result rows, row failures and
/// the metrics of the run
pub async fn run_plan(
    plan: &[Projection],
    rows: Vec<Vec<Value>>,
    settings: ExecutionSettings,
    local: &LocalRun,
) -> ExecResult<JsonValue> {
    let cluster = Arc::new(LocalCluster::new(local.nodes, local.shards_per_index));
    for index in &local.indices {
        cluster.create_index(index);
    }
    let ctx = context(&settings, local.shard.clone());
    let factory = ProjectorFactory::new(ClusterServices::local(cluster), settings);

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut bucket = SharedRowBucket::new(rows, width);
    let result = execute(&factory, plan, &ctx, &mut bucket).await?;

    let failures: Vec<JsonValue> = ctx
        .failures
        .failures()
        .into_iter()
        .map(|f| json!({ "stage": f.stage, "message": f.message }))
        .collect();
    Ok(json!({
        "rows": result
            .iter()
            .map(|row| JsonValue::Array(row.iter().map(Value::to_json).collect()))
            .collect::<Vec<_>>(),
        "failures": failures,
        "metrics": factory.services().metrics.snapshot(),
    }))
}

/// Compiles every stage of `plan`; returns their kinds
pub fn validate_plan(
    plan: &[Projection],
    settings: ExecutionSettings,
    shard: Option<ShardId>,
) -> ExecResult<Vec<&'static str>> {
    let ctx = context(&settings, shard);
    let cluster = Arc::new(LocalCluster::new(1, 1));
    let factory = ProjectorFactory::new(ClusterServices::local(cluster), settings);
    let projectors = factory.compile_all(plan, &ctx)?;
    Ok(projectors.iter().map(|p| p.kind()).collect())
}

fn context(settings: &ExecutionSettings, shard: Option<ShardId>) -> ExecutionContext {
    let ctx = ExecutionContext::for_job(settings);
    match shard {
        Some(shard) => ctx.with_shard(shard),
        None => ctx,
    }
}

fn load_settings(path: Option<&Path>) -> CliResult<ExecutionSettings> {
    let settings = match path {
        Some(path) => ExecutionSettings::load(path)
            .map_err(|e| CliError::config_error(e.to_string()))?,
        None => ExecutionSettings::default(),
    };
    Logger::set_min_severity(settings.log_severity());
    Ok(settings)
}

fn load_plan(path: &Path) -> CliResult<Vec<Projection>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| CliError::io_error(format!("Failed to read {}: {}", path.display(), e)))?;
    Ok(Projection::plan_from_json(&content)?)
}

fn load_rows(path: &Path) -> CliResult<Vec<Vec<Value>>> {
    match read_json_file(path)? {
        JsonValue::Array(rows) => rows
            .into_iter()
            .map(|row| match row {
                JsonValue::Array(cells) => Ok(cells.into_iter().map(Value::from).collect()),
                other => Err(CliError::invalid_argument(format!(
                    "each row must be a JSON array, got {}",
                    other
                ))),
            })
            .collect(),
        _ => Err(CliError::invalid_argument("rows must be a JSON array of arrays")),
    }
}

fn parse_shard(shard: Option<&str>) -> CliResult<Option<ShardId>> {
    shard
        .map(|s| {
            ShardId::parse(s).ok_or_else(|| {
                CliError::invalid_argument(format!("invalid shard '{}', expected <index>:<id>", s))
            })
        })
        .transpose()
}
