// Typed CMR records
//
// Each record carries the fields the orchestrator reads plus an opaque
// remainder: unknown fields are preserved untouched via serde flatten so
// round-tripping a record never loses catalog metadata we do not model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A dataset collection record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrCollection {
    pub id: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub version_id: Option<String>,
    #[serde(default)]
    pub associations: Option<CmrAssociations>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Concept ids a collection is associated with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CmrAssociations {
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub visualizations: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A variable record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrVariable {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub long_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A service record, the source of workflow step chains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrService {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A grid record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrGrid {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A visualization record associated with a collection or variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrVisualization {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An access-permission record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmrPermission {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Granule hit count for a collection query
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CmrGranuleHits {
    pub hits: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = json!({
            "id": "C1234-PROV",
            "short_name": "MOD021KM",
            "boxes": ["-90 -180 90 180"],
            "processing_level_id": "1B"
        });
        let collection: CmrCollection = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(collection.id, "C1234-PROV");
        assert_eq!(collection.extra["processing_level_id"], "1B");

        let back = serde_json::to_value(&collection).unwrap();
        assert_eq!(back["boxes"], raw["boxes"]);
    }
}
