//! Running summary of a batched write stage

use std::collections::BTreeMap;

use crate::cluster::NodeId;
use crate::data::Value;
use crate::projection::WriterResultMode;

#[derive(Debug, Clone, Default, PartialEq)]
struct SourceSummary {
    succeeded: u64,
    failed: u64,
    errors: BTreeMap<String, u64>,
}

/// Per-item outcomes merged across all bulk requests of a stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSummary {
    succeeded: u64,
    failed: u64,
    by_source: BTreeMap<(NodeId, Option<String>), SourceSummary>,
}

impl BulkSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn record_success(&mut self, node: &NodeId, source_uri: Option<&str>) {
        self.succeeded += 1;
        self.entry(node, source_uri).succeeded += 1;
    }

    pub fn record_failure(&mut self, node: &NodeId, source_uri: Option<&str>, message: &str) {
        self.failed += 1;
        let entry = self.entry(node, source_uri);
        entry.failed += 1;
        *entry.errors.entry(message.to_string()).or_insert(0) += 1;
    }

    fn entry(&mut self, node: &NodeId, source_uri: Option<&str>) -> &mut SourceSummary {
        self.by_source
            .entry((node.clone(), source_uri.map(str::to_string)))
            .or_default()
    }

    /// Result rows of the stage.
    ///
    /// `RowCount`: one row `[succeeded]`.
    /// `ReturnSummary`: one row per (node, source uri):
    /// `[node_id, source_uri, success_count, error_count, {message: count}]`.
    pub fn to_rows(&self, mode: WriterResultMode) -> Vec<Vec<Value>> {
        match mode {
            WriterResultMode::RowCount => vec![vec![Value::Long(self.succeeded as i64)]],
            WriterResultMode::ReturnSummary => self
                .by_source
                .iter()
                .map(|((node, uri), summary)| {
                    vec![
                        Value::Text(node.clone()),
                        uri.clone().map(Value::Text).unwrap_or(Value::Null),
                        Value::Long(summary.succeeded as i64),
                        Value::Long(summary.failed as i64),
                        Value::Object(
                            summary
                                .errors
                                .iter()
                                .map(|(message, count)| (message.clone(), Value::Long(*count as i64)))
                                .collect(),
                        ),
                    ]
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_count() {
        let mut summary = BulkSummary::new();
        let node = "n1".to_string();
        summary.record_success(&node, None);
        summary.record_success(&node, None);
        summary.record_failure(&node, None, "boom");
        assert_eq!(summary.to_rows(WriterResultMode::RowCount), vec![vec![Value::Long(2)]]);
        assert_eq!(summary.failed(), 1);
    }

    #[test]
    fn test_return_summary_groups_errors() {
        let mut summary = BulkSummary::new();
        let node = "n1".to_string();
        summary.record_success(&node, Some("file:///a.json"));
        summary.record_failure(&node, Some("file:///a.json"), "duplicate");
        summary.record_failure(&node, Some("file:///a.json"), "duplicate");
        summary.record_failure(&node, Some("file:///b.json"), "parse");

        let rows = summary.to_rows(WriterResultMode::ReturnSummary);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::from("file:///a.json"));
        assert_eq!(rows[0][2], Value::Long(1));
        assert_eq!(rows[0][3], Value::Long(2));
        assert_eq!(
            rows[0][4],
            Value::Object(BTreeMap::from([("duplicate".to_string(), Value::Long(2))]))
        );
    }
}
