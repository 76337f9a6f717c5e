// Process configuration
//
// All knobs are environment-provided, parsed once at startup, and the
// resulting Config is injected into the components and never mutated.

use std::time::Duration;

use crate::error::{Result, ServiceError};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum retries per work item before it is failed
    pub work_item_retry_limit: i32,

    /// Items per page of an aggregated STAC catalog
    pub aggregate_stac_catalog_max_page_size: usize,

    /// System-wide cap on granules per request
    pub max_granule_limit: i32,

    /// Page size the catalog-query step uses against the metadata catalog
    pub cmr_max_page_size: i32,

    /// TTL for cached metadata catalog responses
    pub cmr_cache_ttl: Duration,

    /// Byte-size cap for the metadata catalog cache
    pub cmr_cache_size: u64,

    /// Lease lifetime for a running work item
    pub visibility_timeout: Duration,

    /// Interval between lease reaper sweeps
    pub reaper_interval: Duration,

    /// Poll interval used while a synchronous request waits for its job
    pub sync_request_poll_interval_ms: u64,

    /// Granule count above which an asynchronous job starts in previewing
    pub preview_threshold: i32,

    /// Serve any owner's synchronous work before any asynchronous work.
    /// Off by default: the synchronous preference applies within one owner only.
    pub sync_priority_across_owners: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_item_retry_limit: 3,
            aggregate_stac_catalog_max_page_size: 2000,
            max_granule_limit: 350_000,
            cmr_max_page_size: 2000,
            cmr_cache_ttl: Duration::from_secs(600),
            cmr_cache_size: 32 * 1024 * 1024,
            visibility_timeout: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(180),
            sync_request_poll_interval_ms: 100,
            preview_threshold: 500,
            sync_priority_across_owners: false,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Self {
            work_item_retry_limit: env_parse("WORK_ITEM_RETRY_LIMIT", defaults.work_item_retry_limit)?,
            aggregate_stac_catalog_max_page_size: env_parse(
                "AGGREGATE_STAC_CATALOG_MAX_PAGE_SIZE",
                defaults.aggregate_stac_catalog_max_page_size,
            )?,
            max_granule_limit: env_parse("MAX_GRANULE_LIMIT", defaults.max_granule_limit)?,
            cmr_max_page_size: env_parse("CMR_MAX_PAGE_SIZE", defaults.cmr_max_page_size)?,
            cmr_cache_ttl: Duration::from_secs(env_parse(
                "CMR_CACHE_TTL_SECONDS",
                defaults.cmr_cache_ttl.as_secs(),
            )?),
            cmr_cache_size: env_parse("CMR_CACHE_SIZE_BYTES", defaults.cmr_cache_size)?,
            visibility_timeout: Duration::from_secs(env_parse(
                "VISIBILITY_TIMEOUT_SECONDS",
                defaults.visibility_timeout.as_secs(),
            )?),
            reaper_interval: Duration::from_secs(env_parse(
                "REAPER_INTERVAL_SECONDS",
                defaults.reaper_interval.as_secs(),
            )?),
            sync_request_poll_interval_ms: env_parse(
                "SYNC_REQUEST_POLL_INTERVAL_MS",
                defaults.sync_request_poll_interval_ms,
            )?,
            preview_threshold: env_parse("PREVIEW_THRESHOLD", defaults.preview_threshold)?,
            sync_priority_across_owners: env_parse(
                "SYNC_PRIORITY_ACROSS_OWNERS",
                defaults.sync_priority_across_owners,
            )?,
        })
    }

    /// Validate invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<()> {
        if self.work_item_retry_limit < 0 {
            return Err(ServiceError::validation("WORK_ITEM_RETRY_LIMIT must be >= 0"));
        }
        if self.aggregate_stac_catalog_max_page_size < 1 {
            return Err(ServiceError::validation(
                "AGGREGATE_STAC_CATALOG_MAX_PAGE_SIZE must be >= 1",
            ));
        }
        if self.max_granule_limit < 1 {
            return Err(ServiceError::validation("MAX_GRANULE_LIMIT must be >= 1"));
        }
        if self.cmr_max_page_size < 1 {
            return Err(ServiceError::validation("CMR_MAX_PAGE_SIZE must be >= 1"));
        }
        if self.sync_request_poll_interval_ms < 1 {
            return Err(ServiceError::validation(
                "SYNC_REQUEST_POLL_INTERVAL_MS must be >= 1",
            ));
        }
        Ok(())
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ServiceError::validation(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
    }

    #[test]
    fn invalid_page_size_is_rejected() {
        let config = Config {
            aggregate_stac_catalog_max_page_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
