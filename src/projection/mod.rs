//! Logical projections
//!
//! A projection is the immutable, planner-produced description of one
//! execution stage. The set of kinds is closed: the compiler matches on
//! `Projection` exhaustively.
//!
//! Projections arrive as JSON objects tagged by `"type"`:
//!
//! ```json
//! {"type": "filter", "query": {"kind": "literal", "value": true}}
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregation::{AggregateMode, Aggregation};
use crate::data::Value;
use crate::engine::{ExecResult, ExecutionError};
use crate::expression::Symbol;

/// One logical execution stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Projection {
    OrderedTopN(OrderedTopNProjection),
    TopN(TopNProjection),
    Eval(EvalProjection),
    Filter(FilterProjection),
    Group(GroupProjection),
    Aggregation(AggregationProjection),
    MergeCount,
    Writer(WriterProjection),
    SourceIndexWriter(SourceIndexWriterProjection),
    ColumnIndexWriter(ColumnIndexWriterProjection),
    Update(UpdateProjection),
    Delete(DeleteProjection),
    Fetch(FetchProjection),
    SysUpdate(SysUpdateProjection),
}

/// Tags accepted by `Projection::from_json`
pub const PROJECTION_KINDS: &[&str] = &[
    "ordered_top_n",
    "top_n",
    "eval",
    "filter",
    "group",
    "aggregation",
    "merge_count",
    "writer",
    "source_index_writer",
    "column_index_writer",
    "update",
    "delete",
    "fetch",
    "sys_update",
];

impl Projection {
    /// Stable kind tag, as used in JSON and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Projection::OrderedTopN(_) => "ordered_top_n",
            Projection::TopN(_) => "top_n",
            Projection::Eval(_) => "eval",
            Projection::Filter(_) => "filter",
            Projection::Group(_) => "group",
            Projection::Aggregation(_) => "aggregation",
            Projection::MergeCount => "merge_count",
            Projection::Writer(_) => "writer",
            Projection::SourceIndexWriter(_) => "source_index_writer",
            Projection::ColumnIndexWriter(_) => "column_index_writer",
            Projection::Update(_) => "update",
            Projection::Delete(_) => "delete",
            Projection::Fetch(_) => "fetch",
            Projection::SysUpdate(_) => "sys_update",
        }
    }

    /// Parses one projection.
    ///
    /// An unknown or missing `"type"` tag is `UnsupportedStage`; a known tag
    /// with malformed parameters is `InvalidParameter`.
    pub fn from_json_value(value: serde_json::Value) -> ExecResult<Self> {
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        match tag {
            Some(tag) if PROJECTION_KINDS.contains(&tag.as_str()) => serde_json::from_value(value)
                .map_err(|e| {
                    ExecutionError::invalid_parameter(format!("malformed {} projection: {}", tag, e))
                }),
            Some(tag) => Err(ExecutionError::UnsupportedStage(tag)),
            None => Err(ExecutionError::UnsupportedStage("<untagged>".to_string())),
        }
    }

    pub fn from_json(content: &str) -> ExecResult<Self> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| ExecutionError::invalid_parameter(format!("invalid JSON: {}", e)))?;
        Self::from_json_value(value)
    }

    /// Parses a plan: a JSON array of projections, in chain order
    pub fn plan_from_json(content: &str) -> ExecResult<Vec<Self>> {
        let value: serde_json::Value = serde_json::from_str(content)
            .map_err(|e| ExecutionError::invalid_parameter(format!("invalid JSON: {}", e)))?;
        match value {
            serde_json::Value::Array(items) => {
                items.into_iter().map(Self::from_json_value).collect()
            }
            _ => Err(ExecutionError::invalid_parameter(
                "a plan must be a JSON array of projections",
            )),
        }
    }
}

// ==================
// Query shaping
// ==================

/// Ordered TopN: sort by `order_by`, emit `outputs`, slice `[offset, offset + limit)`.
///
/// `limit == None` selects an unbounded buffer-all sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedTopNProjection {
    pub outputs: Vec<Symbol>,
    pub order_by: Vec<Symbol>,
    /// Descending flag per order-by column
    #[serde(default)]
    pub reverse_flags: Vec<bool>,
    /// Nulls-first flag per order-by column
    #[serde(default)]
    pub nulls_first: Vec<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNProjection {
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalProjection {
    pub outputs: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterProjection {
    pub query: Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupProjection {
    pub keys: Vec<Symbol>,
    pub values: Vec<Aggregation>,
    #[serde(default)]
    pub mode: AggregateMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationProjection {
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub mode: AggregateMode,
}

// ==================
// File export
// ==================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON object per line keyed by `output_names`
    #[default]
    JsonObject,
    /// One JSON array per line
    JsonArray,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterProjection {
    /// Target directory; the file name inside it is derived per shard or job
    pub uri: String,
    #[serde(default)]
    pub compression: Option<Compression>,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Columns to write; empty means the first input column is the document
    #[serde(default)]
    pub inputs: Vec<Symbol>,
    #[serde(default)]
    pub output_names: Vec<String>,
    /// Literal keys merged into every JSON object record
    #[serde(default)]
    pub overwrites: BTreeMap<String, Value>,
}

// ==================
// Batched writes
// ==================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterResultMode {
    /// One row: `[succeeded]`
    #[default]
    RowCount,
    /// One row per (node, source uri) with error details
    ReturnSummary,
}

/// Target table addressing shared by both index writers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexTarget {
    pub table: String,
    #[serde(default)]
    pub primary_keys: Vec<Symbol>,
    #[serde(default)]
    pub clustered_by: Option<Symbol>,
    #[serde(default)]
    pub partitioned_by: Vec<Symbol>,
    #[serde(default)]
    pub auto_create_indices: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceIndexWriterProjection {
    pub target: IndexTarget,
    /// Column holding the raw JSON object document
    pub raw_source: Symbol,
    #[serde(default)]
    pub includes: Option<Vec<String>>,
    #[serde(default)]
    pub excludes: Option<Vec<String>>,
    #[serde(default)]
    pub overwrite_duplicates: bool,
    /// Column holding the origin URI, used by the summary result mode
    #[serde(default)]
    pub source_uri: Option<Symbol>,
    #[serde(default)]
    pub bulk_actions: Option<usize>,
    #[serde(default)]
    pub result_mode: WriterResultMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnIndexWriterProjection {
    pub target: IndexTarget,
    pub columns: Vec<String>,
    pub column_symbols: Vec<Symbol>,
    /// Upsert assignments applied when the id already exists
    #[serde(default)]
    pub on_duplicate_key: Option<BTreeMap<String, Symbol>>,
    #[serde(default)]
    pub ignore_duplicate_keys: bool,
    #[serde(default)]
    pub bulk_actions: Option<usize>,
    #[serde(default)]
    pub result_mode: WriterResultMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateProjection {
    /// Column holding the document id
    pub uid: Symbol,
    pub assignments: BTreeMap<String, Symbol>,
    #[serde(default)]
    pub required_version: Option<Symbol>,
    #[serde(default)]
    pub bulk_actions: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteProjection {
    pub uid: Symbol,
    #[serde(default)]
    pub bulk_actions: Option<usize>,
}

// ==================
// Fetch
// ==================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderLocation {
    pub reader_id: u32,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchProjection {
    /// Input column holding the 64-bit fetch id
    pub fetch_id: usize,
    /// Columns fetched per document, appended to the input row
    pub columns: Vec<String>,
    /// Owning node of every reader referenced by the fetch ids
    pub readers: Vec<ReaderLocation>,
    #[serde(default)]
    pub fetch_size: Option<usize>,
}

// ==================
// System tables
// ==================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysAssignment {
    pub relation: String,
    pub column: String,
    pub value: Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SysUpdateProjection {
    /// Column holding the system row's key
    pub key: Symbol,
    pub assignments: Vec<SysAssignment>,
}
