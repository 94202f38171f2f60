//! Callback metadata attached to a transaction on its terminal transition.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Loosely-typed upstream value. Amounts arrive as numbers, receipt numbers
/// as strings, and transaction dates as integer-encoded timestamps. Anything
/// else is kept verbatim so that an unexpected item never rejects the
/// callback it came with.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(serde_json::Number),
    Text(String),
    #[default]
    Null,
    Other(serde_json::Value),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Number(value.into())
    }
}

/// One `{Name, Value}` pair from the upstream metadata list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: MetadataValue,
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Flattens the upstream list into a map. Items without a name are dropped;
/// a repeated name keeps the last value.
pub fn parse_metadata(items: &[MetadataItem]) -> Metadata {
    items
        .iter()
        .filter(|item| !item.name.is_empty())
        .map(|item| (item.name.clone(), item.value.clone()))
        .collect()
}
