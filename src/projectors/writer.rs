//! File export
//!
//! Writes one JSON record per line to a local file, optionally gzip
//! compressed. The file is opened on the first row (or on finish for an
//! empty input), never at compile time. Opening and closing run on the
//! blocking pool; per-row writes go to an in-memory buffer.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::data::{Row, Value};
use crate::engine::{
    Downstream, ExecResult, ExecutionContext, ExecutionError, Lifecycle, Projector, RowFlow,
    RowReceiver,
};
use crate::expression::InputRow;
use crate::observability::{log_event, Event, MetricsRegistry};
use crate::projection::{Compression, OutputFormat};

const FILE_SCHEME: &str = "file://";

/// Resolves the export target of `uri`.
///
/// The URI always names a directory. The file name inside it is derived
/// from the shard (`<index>_<id>.json`) or the job id (`<job>.json`), with
/// `.gz` appended for gzip output.
pub fn resolve_target(
    uri: &str,
    ctx: &ExecutionContext,
    compression: Option<Compression>,
) -> ExecResult<PathBuf> {
    let path = match uri.strip_prefix(FILE_SCHEME) {
        Some(path) => path,
        None if uri.contains("://") => {
            return Err(ExecutionError::invalid_parameter(format!(
                "unsupported export URI scheme: {}",
                uri
            )))
        }
        None => uri,
    };
    if path.is_empty() {
        return Err(ExecutionError::invalid_parameter("export URI has no path"));
    }

    let mut name = match &ctx.shard_id {
        Some(shard) => format!("{}_{}.json", shard.index, shard.id),
        None => format!("{}.json", ctx.job_id),
    };
    if compression == Some(Compression::Gzip) {
        name.push_str(".gz");
    }
    Ok(Path::new(path).join(name))
}

/// How a row becomes a record
pub enum RecordShape {
    /// The first column is written as the document
    Document,
    /// Evaluated columns written as an object keyed by the names
    Object { columns: InputRow, names: Vec<String> },
    /// Evaluated columns written as an array
    Array { columns: InputRow },
}

enum Output {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Output {
    fn open(path: &Path, compression: Option<Compression>) -> ExecResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = BufWriter::new(File::create(path)?);
        Ok(match compression {
            Some(Compression::Gzip) => {
                Output::Gzip(GzEncoder::new(file, flate2::Compression::default()))
            }
            None => Output::Plain(file),
        })
    }

    fn write_line(&mut self, line: &[u8]) -> ExecResult<()> {
        let writer: &mut dyn Write = match self {
            Output::Plain(w) => w,
            Output::Gzip(w) => w,
        };
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(self) -> ExecResult<()> {
        match self {
            Output::Plain(mut w) => w.flush()?,
            Output::Gzip(w) => w.finish()?.flush()?,
        }
        Ok(())
    }
}

/// Exports rows; emits `[rows_written]`
pub struct WriterProjector {
    lifecycle: Lifecycle,
    downstream: Downstream,
    path: PathBuf,
    compression: Option<Compression>,
    shape: RecordShape,
    overwrites: BTreeMap<String, Value>,
    output: Option<Output>,
    rows_written: u64,
    metrics: Arc<MetricsRegistry>,
}

impl WriterProjector {
    pub fn new(
        path: PathBuf,
        compression: Option<Compression>,
        shape: RecordShape,
        overwrites: BTreeMap<String, Value>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("writer"),
            downstream: Downstream::default(),
            path,
            compression,
            shape,
            overwrites,
            output: None,
            rows_written: 0,
            metrics,
        }
    }

    /// Shape for the given projection parameters
    pub fn shape_for(
        format: OutputFormat,
        columns: Option<InputRow>,
        names: Vec<String>,
    ) -> ExecResult<RecordShape> {
        let Some(columns) = columns else {
            return Ok(RecordShape::Document);
        };
        match format {
            OutputFormat::JsonArray => Ok(RecordShape::Array { columns }),
            OutputFormat::JsonObject => {
                if names.len() != columns.width() {
                    return Err(ExecutionError::invalid_parameter(format!(
                        "writer has {} output names for {} inputs",
                        names.len(),
                        columns.width()
                    )));
                }
                Ok(RecordShape::Object { columns, names })
            }
        }
    }

    fn record(&self, row: &dyn Row) -> ExecResult<serde_json::Value> {
        let value = match &self.shape {
            RecordShape::Document => {
                if row.num_columns() == 0 {
                    return Err(ExecutionError::evaluation("writer received an empty row"));
                }
                row.get(0).clone()
            }
            RecordShape::Object { columns, names } => Value::Object(
                names
                    .iter()
                    .cloned()
                    .zip(columns.evaluate_owned(row)?)
                    .collect(),
            ),
            RecordShape::Array { columns } => Value::Array(columns.evaluate_owned(row)?),
        };
        let value = match value {
            Value::Object(mut fields) if !self.overwrites.is_empty() => {
                fields.extend(self.overwrites.clone());
                Value::Object(fields)
            }
            other => other,
        };
        Ok(value.to_json())
    }

    async fn output(&mut self) -> ExecResult<&mut Output> {
        if self.output.is_none() {
            let path = self.path.clone();
            let compression = self.compression;
            self.output = Some(blocking(move || Output::open(&path, compression)).await?);
        }
        self.output
            .as_mut()
            .ok_or_else(|| ExecutionError::Internal("export file not open".to_string()))
    }
}

async fn blocking<T, F>(f: F) -> ExecResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ExecResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExecutionError::Internal(format!("export task failed: {}", e)))?
}

impl RowReceiver for WriterProjector {
    fn take_row<'a>(&'a mut self, row: &'a dyn Row) -> BoxFuture<'a, ExecResult<RowFlow>> {
        async move {
            self.lifecycle.on_row()?;
            let record = self.record(row)?;
            let line = serde_json::to_vec(&record)
                .map_err(|e| ExecutionError::Io(format!("failed to encode record: {}", e)))?;
            self.output().await?.write_line(&line)?;
            self.rows_written += 1;
            Ok(RowFlow::Continue)
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, ExecResult<()>> {
        async move {
            self.lifecycle.on_finish()?;
            self.output().await?;
            if let Some(output) = self.output.take() {
                blocking(move || output.close()).await?;
            }
            self.metrics.add_rows_exported(self.rows_written);
            log_event(
                Event::FileWriterClosed,
                &[
                    ("path", self.path.display().to_string().as_str()),
                    ("rows", self.rows_written.to_string().as_str()),
                ],
            );
            let row = vec![Value::Long(self.rows_written as i64)];
            self.downstream.push(&row).await?;
            self.downstream.finish().await
        }
        .boxed()
    }

    fn fail(&mut self, error: ExecutionError) -> BoxFuture<'_, ()> {
        async move {
            if self.lifecycle.on_fail() {
                if let Some(output) = self.output.take() {
                    let _ = blocking(move || output.close()).await;
                }
                self.downstream.fail(error).await;
            }
        }
        .boxed()
    }
}

impl Projector for WriterProjector {
    fn kind(&self) -> &'static str {
        "writer"
    }

    fn set_downstream(&mut self, downstream: Box<dyn RowReceiver>) {
        self.downstream.set(downstream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ShardId;
    use crate::config::ExecutionSettings;
    use crate::engine::RowCollector;
    use crate::expression::Symbol;
    use std::io::Read;

    fn ctx() -> ExecutionContext {
        ExecutionContext::for_job(&ExecutionSettings::default())
    }

    #[test]
    fn test_resolve_target() {
        let ctx = ctx();
        assert_eq!(
            resolve_target("file:///tmp/out", &ctx, None).unwrap(),
            PathBuf::from(format!("/tmp/out/{}.json", ctx.job_id))
        );
        assert_eq!(
            resolve_target("/tmp/dir/", &ctx, Some(Compression::Gzip)).unwrap(),
            PathBuf::from(format!("/tmp/dir/{}.json.gz", ctx.job_id))
        );
        let on_shard = ctx.clone().with_shard(ShardId::new("t", 3));
        assert_eq!(
            resolve_target("file:///tmp/dir/", &on_shard, None).unwrap(),
            PathBuf::from("/tmp/dir/t_3.json")
        );
        assert!(matches!(
            resolve_target("s3://bucket/key", &ctx, None),
            Err(ExecutionError::InvalidParameter(_))
        ));
    }

    /// Failing after rows were written still closes the file and passes
    /// the error on.
    #[tokio::test]
    async fn test_fail_closes_file_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        let mut writer = WriterProjector::new(
            path.clone(),
            None,
            RecordShape::Document,
            BTreeMap::new(),
            Arc::new(MetricsRegistry::new()),
        );
        let (collector, handle) = RowCollector::new();
        writer.set_downstream(Box::new(collector));
        writer.take_row(&vec![Value::Long(1)]).await.unwrap();
        writer.fail(ExecutionError::Cancelled).await;

        assert_eq!(handle.result().await, Err(ExecutionError::Cancelled));
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n");
    }

    async fn export(mut writer: WriterProjector, rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
        let (collector, handle) = RowCollector::new();
        writer.set_downstream(Box::new(collector));
        for row in rows {
            writer.take_row(&row).await.unwrap();
        }
        writer.finish().await.unwrap();
        handle.result().await.unwrap()
    }

    #[tokio::test]
    async fn test_json_object_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let shape = WriterProjector::shape_for(
            OutputFormat::JsonObject,
            Some(InputRow::compile(&[Symbol::input(0), Symbol::input(1)]).unwrap()),
            vec!["id".into(), "name".into()],
        )
        .unwrap();
        let overwrites = BTreeMap::from([("src".to_string(), Value::from("export"))]);
        let writer = WriterProjector::new(
            path.clone(),
            None,
            shape,
            overwrites,
            Arc::new(MetricsRegistry::new()),
        );

        let result = export(
            writer,
            vec![
                vec![Value::Long(1), Value::from("a")],
                vec![Value::Long(2), Value::from("b")],
            ],
        )
        .await;
        assert_eq!(result, vec![vec![Value::Long(2)]]);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"id":1,"name":"a","src":"export"}"#);
    }

    #[tokio::test]
    async fn test_gzip_array_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json.gz");
        let shape = WriterProjector::shape_for(
            OutputFormat::JsonArray,
            Some(InputRow::compile(&[Symbol::input(0)]).unwrap()),
            Vec::new(),
        )
        .unwrap();
        let writer = WriterProjector::new(
            path.clone(),
            Some(Compression::Gzip),
            shape,
            BTreeMap::new(),
            Arc::new(MetricsRegistry::new()),
        );
        export(writer, vec![vec![Value::Long(7)], vec![Value::Null]]).await;

        let mut decoded = String::new();
        flate2::read::GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "[7]\n[null]\n");
    }

    #[tokio::test]
    async fn test_empty_input_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("empty.json");
        let writer = WriterProjector::new(
            path.clone(),
            None,
            RecordShape::Document,
            BTreeMap::new(),
            Arc::new(MetricsRegistry::new()),
        );
        let result = export(writer, Vec::new()).await;
        assert_eq!(result, vec![vec![Value::Long(0)]]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_object_shape_requires_names() {
        let shape = WriterProjector::shape_for(
            OutputFormat::JsonObject,
            Some(InputRow::compile(&[Symbol::input(0)]).unwrap()),
            Vec::new(),
        );
        assert!(shape.is_err());
    }
}
