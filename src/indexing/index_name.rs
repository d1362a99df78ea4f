//! Target index names, document ids and routing
//!
//! Partitioned tables store each partition in its own index named
//! `.partitioned.<table>.<ident>`, where `<ident>` is the URL-safe base64
//! of the JSON array of partition values.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use uuid::Uuid;

use crate::data::{Row, Value};
use crate::engine::ExecResult;
use crate::expression::{Input, InputFactory, Symbol};

pub const PARTITIONED_PREFIX: &str = ".partitioned.";

/// Index name of one partition of `table`
pub fn partition_index_name(table: &str, values: &[Value]) -> String {
    let json = serde_json::Value::Array(values.iter().map(Value::to_json).collect());
    format!(
        "{}{}.{}",
        PARTITIONED_PREFIX,
        table,
        URL_SAFE_NO_PAD.encode(json.to_string())
    )
}

/// Decodes the partition values of a partition index name
pub fn partition_values(index: &str) -> Option<Vec<Value>> {
    let rest = index.strip_prefix(PARTITIONED_PREFIX)?;
    let (_, ident) = rest.rsplit_once('.')?;
    let bytes = URL_SAFE_NO_PAD.decode(ident).ok()?;
    match serde_json::from_slice::<serde_json::Value>(&bytes).ok()? {
        serde_json::Value::Array(items) => Some(items.into_iter().map(Value::from).collect()),
        _ => None,
    }
}

/// Derives the target index of a row
pub struct IndexNameResolver {
    table: String,
    partitions: Vec<Box<dyn Input>>,
}

impl IndexNameResolver {
    pub fn compile(table: &str, partitioned_by: &[Symbol]) -> ExecResult<Self> {
        Ok(Self {
            table: table.to_string(),
            partitions: InputFactory::compile_all(partitioned_by)?,
        })
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partitions.is_empty()
    }

    pub fn resolve(&self, row: &dyn Row) -> ExecResult<String> {
        if self.partitions.is_empty() {
            return Ok(self.table.clone());
        }
        let values = self
            .partitions
            .iter()
            .map(|p| p.value(row))
            .collect::<ExecResult<Vec<_>>>()?;
        Ok(partition_index_name(&self.table, &values))
    }
}

/// Id and routing key of one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocAddress {
    pub id: String,
    pub routing: Option<String>,
}

impl DocAddress {
    /// Key used to pick the shard
    pub fn routing_key(&self) -> &str {
        self.routing.as_deref().unwrap_or(&self.id)
    }
}

/// Builds document ids from primary-key columns and routing from the
/// clustered-by column.
///
/// Without primary keys every document gets a fresh random id. A single
/// key is used verbatim; several keys are encoded together.
pub struct DocAddressBuilder {
    primary_keys: Vec<Box<dyn Input>>,
    clustered_by: Option<Box<dyn Input>>,
}

impl DocAddressBuilder {
    pub fn compile(primary_keys: &[Symbol], clustered_by: Option<&Symbol>) -> ExecResult<Self> {
        Ok(Self {
            primary_keys: InputFactory::compile_all(primary_keys)?,
            clustered_by: clustered_by.map(InputFactory::compile).transpose()?,
        })
    }

    /// `Ok(Err(message))` marks a malformed item: it fails alone
    pub fn build(&self, row: &dyn Row) -> ExecResult<Result<DocAddress, String>> {
        let id = match self.primary_keys.as_slice() {
            [] => Uuid::new_v4().to_string(),
            [single] => match single.value(row)? {
                Value::Null => return Ok(Err("primary key value must not be null".to_string())),
                value => value.to_string(),
            },
            keys => {
                let values = keys
                    .iter()
                    .map(|k| k.value(row))
                    .collect::<ExecResult<Vec<_>>>()?;
                if values.iter().any(Value::is_null) {
                    return Ok(Err("primary key value must not be null".to_string()));
                }
                let json = serde_json::Value::Array(values.iter().map(Value::to_json).collect());
                URL_SAFE_NO_PAD.encode(json.to_string())
            }
        };
        let routing = match &self.clustered_by {
            Some(input) => match input.value(row)? {
                Value::Null => return Ok(Err("clustered by value must not be null".to_string())),
                value => Some(value.to_string()),
            },
            None => None,
        };
        Ok(Ok(DocAddress { id, routing }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name_roundtrip_and_stability() {
        let values = vec![Value::Long(2024), Value::from("eu")];
        let name = partition_index_name("events", &values);
        assert!(name.starts_with(".partitioned.events."));
        assert_eq!(name, partition_index_name("events", &values));
        assert_eq!(partition_values(&name), Some(values));
        assert_eq!(partition_values("events"), None);
    }

    #[test]
    fn test_resolver_without_partitions() {
        let resolver = IndexNameResolver::compile("t", &[]).unwrap();
        assert!(!resolver.is_partitioned());
        assert_eq!(resolver.resolve(&vec![Value::Long(1)]).unwrap(), "t");
    }

    #[test]
    fn test_single_key_id_and_routing() {
        let builder = DocAddressBuilder::compile(&[Symbol::input(0)], Some(&Symbol::input(1))).unwrap();
        let address = builder
            .build(&vec![Value::Long(7), Value::from("r")])
            .unwrap()
            .unwrap();
        assert_eq!(address.id, "7");
        assert_eq!(address.routing_key(), "r");
    }

    #[test]
    fn test_null_key_is_malformed() {
        let builder = DocAddressBuilder::compile(&[Symbol::input(0)], None).unwrap();
        assert!(builder.build(&vec![Value::Null]).unwrap().is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let builder = DocAddressBuilder::compile(&[], None).unwrap();
        let a = builder.build(&Vec::<Value>::new()).unwrap().unwrap();
        let b = builder.build(&Vec::<Value>::new()).unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.routing_key(), a.id);
    }
}
