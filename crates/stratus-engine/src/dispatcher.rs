//! Dispatcher
//!
//! The worker-facing read side: given a service image, return zero or
//! one leased item. Selection and the lease itself are one atomic store
//! operation; this layer shapes the payload a worker receives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use utoipa::ToSchema;

use stratus_core::{Config, Result, ServiceError, WorkItem};
use stratus_storage::{LeasePolicy, Store};

use crate::planner::QUERY_CMR_IMAGE;

/// What a worker receives from one poll
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkAssignment {
    pub work_item: WorkItem,
    /// The step's opaque data-operation parameters
    #[schema(value_type = Object)]
    pub operation: serde_json::Value,
    /// Granule budget, present only for catalog-query items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cmr_granules: Option<i32>,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    config: Config,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self { store, config }
    }

    /// Lease the next item for a worker presenting `service_image`.
    #[instrument(skip(self))]
    pub async fn next_work(&self, service_image: &str) -> Result<Option<WorkAssignment>> {
        if service_image.is_empty() {
            return Err(ServiceError::validation("serviceID is required"));
        }

        let policy = LeasePolicy {
            visibility_timeout: self.config.visibility_timeout,
            sync_priority_across_owners: self.config.sync_priority_across_owners,
        };

        let Some(leased) = self.store.lease_work_item(service_image, &policy).await? else {
            return Ok(None);
        };

        let max_cmr_granules = (leased.item.service_image == QUERY_CMR_IMAGE)
            .then(|| leased.num_input_granules.min(self.config.cmr_max_page_size));

        debug!(
            item_id = leased.item.id,
            job_id = %leased.item.job_id,
            step_index = leased.item.step_index,
            "dispatched work item"
        );

        Ok(Some(WorkAssignment {
            work_item: leased.item,
            operation: leased.operation,
            max_cmr_granules,
        }))
    }
}
