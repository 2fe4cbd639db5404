use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::build::BuildDoc;

/// Private mapping key carrying the hub document type. Modern engines reject
/// unknown top-level mapping keys, so [`IndexMappings::finalize`] strips or
/// repurposes it depending on the engine major version.
pub const HUB_DOC_TYPE_KEY: &str = "__hub_doc_type";

/// Major/minor version reported by the live search-engine cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub major: u64,
    pub minor: u64,
}

impl FromStr for EngineVersion {
    type Err = ParseEngineVersionError;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        let mut parts = version.split('.');
        let major = parts
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ParseEngineVersionError(version.to_owned()))?;
        let minor = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        Ok(EngineVersion { major, minor })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("`{0}` is not a valid engine version number.")]
pub struct ParseEngineVersionError(pub String);

fn default_settings() -> Map<String, Value> {
    let Value::Object(settings) = json!({
        "codec": "best_compression",
        "analysis": {
            "analyzer": {
                "string_lowercase": {
                    "type": "custom",
                    "tokenizer": "keyword",
                    "filter": "lowercase"
                },
                "whitespace_lowercase": {
                    "type": "custom",
                    "tokenizer": "whitespace",
                    "filter": "lowercase"
                }
            }
        }
    }) else {
        unreachable!()
    };
    settings
}

fn default_mappings() -> Map<String, Value> {
    let Value::Object(mappings) = json!({
        "dynamic": false,
        "properties": {}
    }) else {
        unreachable!()
    };
    mappings
}

/// Open-ended settings map submitted at index creation, seeded from defaults
/// and enriched from the build record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings(pub Map<String, Value>);

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings(default_settings())
    }
}

impl IndexSettings {
    pub fn enrich(&mut self, build: &BuildDoc) {
        self.0.insert("number_of_shards".into(), json!(build.num_shards()));
        self.0.insert("number_of_replicas".into(), json!(build.num_replicas()));
    }

    /// Settings are version-independent; finalize only seals the map.
    pub fn finalize(&self, _version: &EngineVersion) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Open-ended mappings map submitted at index creation. Carries the user
/// field mapping under `properties`, the build `_meta` verbatim, and the hub
/// document type under [`HUB_DOC_TYPE_KEY`] until finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMappings(pub Map<String, Value>);

impl Default for IndexMappings {
    fn default() -> Self {
        IndexMappings(default_mappings())
    }
}

impl IndexMappings {
    pub fn enrich(&mut self, build: &BuildDoc) {
        self.0.insert(HUB_DOC_TYPE_KEY.into(), json!(build.doc_type()));
        let properties = self
            .0
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if let (Value::Object(properties), Some(mapping)) = (properties, build.mapping()) {
            for (field, spec) in mapping {
                properties.insert(field.clone(), spec.clone());
            }
        }
        self.0.insert("_meta".into(), build.meta().cloned().unwrap_or_else(|| json!({})));
    }

    /// Shapes the mappings for the live engine version.
    ///
    /// Engines older than major 7 expect the mapping body nested under the
    /// document type name; newer ones take it at the top level but reject
    /// the private hub key, which gets stripped.
    pub fn finalize(&self, version: &EngineVersion) -> Value {
        let mut body = self.0.clone();
        let doc_type = body
            .remove(HUB_DOC_TYPE_KEY)
            .and_then(|v| v.as_str().map(str::to_owned));
        if version.major < 7 {
            let doc_type = doc_type.unwrap_or_else(|| "_doc".to_owned());
            let mut typed = Map::new();
            typed.insert(doc_type, Value::Object(body));
            Value::Object(typed)
        } else {
            Value::Object(body)
        }
    }
}
