//! Service catalog descriptors and validated request input
//!
//! These mirror what the request-ingest layer resolves before handing a
//! request to the planner: the service chain definition, collection
//! metadata (granule hits, limits), and the request parameters themselves.

use serde::{Deserialize, Serialize};

use crate::step::StepOperation;

/// One step of a service's processing chain as declared in its catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStep {
    /// Container image workers present when polling for this step's work
    pub image: String,
    #[serde(default)]
    pub operations: Vec<StepOperation>,
    #[serde(default)]
    pub is_sequential: bool,
    #[serde(default)]
    pub has_aggregated_output: bool,
    /// Share of job progress; unset steps share the remainder uniformly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_weight: Option<f64>,
}

/// A resolved service catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    /// Worker steps after the catalog-query step
    pub steps: Vec<ServiceStep>,
    /// Operations the service is capable of; steps must declare a subset
    #[serde(default)]
    pub capabilities: Vec<StepOperation>,
    /// Cap on granules per request for this service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granule_limit: Option<i32>,
    /// Single-granule requests still run asynchronously when set
    #[serde(default)]
    pub force_async: bool,
}

impl ServiceDefinition {
    /// Check that every step's declared operations are within the
    /// service's capabilities.
    pub fn steps_within_capabilities(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.operations.iter().all(|op| self.capabilities.contains(op)))
    }
}

/// Resolved metadata for one requested collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: String,
    /// Granules matching the request's spatial/temporal constraints
    pub granule_hits: i32,
    /// Per-collection granule cap from the service catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granule_limit: Option<i32>,
    #[serde(default)]
    pub variables: Vec<String>,
}

/// A request that already passed ingest-layer validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationRequest {
    /// Origin request URI, stored on the job verbatim
    pub request: String,
    pub collection_ids: Vec<String>,
    /// Explicitly named granules; a single entry forces one-granule scope
    #[serde(default)]
    pub granule_ids: Vec<String>,
    /// Granule name filter; an exact (non-wildcard) name matches one granule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granule_name: Option<String>,
    /// Client-requested result cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_url: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Opaque data-operation parameters passed through to workers
    pub operation: serde_json::Value,
}

impl TransformationRequest {
    /// True when the request can only ever match one granule.
    pub fn targets_single_granule(&self) -> bool {
        if self.granule_ids.len() == 1 {
            return true;
        }
        match &self.granule_name {
            Some(name) => !name.contains('*') && !name.contains('?'),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> TransformationRequest {
        TransformationRequest {
            request: "https://stratus.example.com/C1-PROV/ogc-api-coverages".to_string(),
            collection_ids: vec!["C1-PROV".to_string()],
            granule_ids: vec![],
            granule_name: None,
            max_results: None,
            ignore_errors: false,
            destination_url: None,
            labels: vec![],
            operation: json!({}),
        }
    }

    #[test]
    fn explicit_granule_id_is_single() {
        let mut req = request();
        req.granule_ids = vec!["G1-PROV".to_string()];
        assert!(req.targets_single_granule());
        req.granule_ids.push("G2-PROV".to_string());
        assert!(!req.targets_single_granule());
    }

    #[test]
    fn wildcard_names_are_not_single() {
        let mut req = request();
        req.granule_name = Some("GRANULE_20200101".to_string());
        assert!(req.targets_single_granule());
        req.granule_name = Some("GRANULE_2020*".to_string());
        assert!(!req.targets_single_granule());
    }
}
