// CMR metadata catalog client
//
// This crate wraps the upstream metadata catalog behind a typed client
// trait, a canonical query representation, and a process-wide cache with
// single-flight fetch. The orchestrator core only ever sees resolved
// records; the wire format of the catalog stays in here.

mod cache;
mod client;
mod query;
mod types;

pub use cache::{CmrCache, CmrCacheConfig};
pub use client::{CachedCmrClient, CmrClient, CmrHttpClient};
pub use query::{cache_key, CmrQuery, QueryType};
pub use types::{
    CmrCollection, CmrGranuleHits, CmrGrid, CmrPermission, CmrService, CmrVariable,
    CmrVisualization,
};
