//! Stored chart configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::BuildError;

/// Field holding the shared-state JSON blob.
pub const SHARED_FIELD: &str = "shared";

/// A stored chart: named code fragments plus metadata.
///
/// `data` maps fragment field names (`params`, `url`, `graph`, `js`, `ui`,
/// config-tab fields, `shared`) to their source text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartConfig {
    /// Unique chart key.
    #[serde(default)]
    pub key: String,
    /// Fragment sources by field name.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Chart metadata.
    #[serde(default)]
    pub meta: ChartMeta,
}

/// Chart metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartMeta {
    /// Chart type, e.g. `graph_node` or `timeseries_node`.
    #[serde(default)]
    pub stype: String,
}

impl ChartConfig {
    /// Parse a chart record from JSON.
    pub fn from_json(json: &str) -> Result<Self, BuildError> {
        serde_json::from_str(json).map_err(|e| BuildError::Config(e.to_string()))
    }

    /// The source of `field`, if present and non-empty.
    pub fn fragment(&self, field: &str) -> Option<&str> {
        self.data
            .get(field)
            .map(String::as_str)
            .filter(|code| !code.is_empty())
    }

    /// The chart type.
    pub fn stype(&self) -> &str {
        &self.meta.stype
    }

    /// Fragment sources, excluding the shared-state blob, in field order.
    pub fn code_fragments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.data
            .iter()
            .filter(|(field, code)| field.as_str() != SHARED_FIELD && !code.is_empty())
            .map(|(field, code)| (field.as_str(), code.as_str()))
    }

    /// Parse the shared-state blob, defaulting to `{}` when absent or empty.
    pub fn parse_shared(&self) -> Result<serde_json::Value, BuildError> {
        match self.fragment(SHARED_FIELD) {
            None => Ok(serde_json::Value::Object(Default::default())),
            Some(raw) if raw.trim().is_empty() => Ok(serde_json::Value::Object(Default::default())),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| BuildError::Config(format!("malformed shared state: {e}"))),
        }
    }
}
