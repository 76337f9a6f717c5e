// Catalog client trait, HTTP implementation, and caching wrapper

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use stratus_core::{Result, ServiceError};
use tracing::instrument;

use crate::cache::{CmrCache, CmrCacheConfig};
use crate::query::{cache_key, CmrQuery, QueryType};
use crate::types::{CmrCollection, CmrGranuleHits, CmrService, CmrVariable};

/// Read access to the upstream metadata catalog
#[async_trait]
pub trait CmrClient: Send + Sync + 'static {
    /// Run a query of the given type, returning the raw response body.
    async fn query(&self, query_type: QueryType, query: &CmrQuery, token: &str) -> Result<Value>;

    async fn collections(&self, query: &CmrQuery, token: &str) -> Result<Vec<CmrCollection>> {
        let body = self.query(QueryType::Collections, query, token).await?;
        parse_items(&body, "collections")
    }

    async fn variables(&self, query: &CmrQuery, token: &str) -> Result<Vec<CmrVariable>> {
        let body = self.query(QueryType::Variables, query, token).await?;
        parse_items(&body, "variables")
    }

    async fn services(&self, query: &CmrQuery, token: &str) -> Result<Vec<CmrService>> {
        let body = self.query(QueryType::Services, query, token).await?;
        parse_items(&body, "services")
    }

    async fn granule_hits(&self, query: &CmrQuery, token: &str) -> Result<CmrGranuleHits> {
        let body = self.query(QueryType::GranuleHits, query, token).await?;
        let hits = body
            .get("hits")
            .and_then(Value::as_i64)
            .ok_or_else(|| ServiceError::server("catalog response missing hits"))?;
        Ok(CmrGranuleHits { hits: hits as i32 })
    }
}

fn parse_items<T: serde::de::DeserializeOwned>(body: &Value, field: &str) -> Result<Vec<T>> {
    let items = body
        .get("items")
        .or_else(|| body.get(field))
        .cloned()
        .unwrap_or_else(|| Value::Array(vec![]));
    serde_json::from_value(items)
        .map_err(|e| ServiceError::server(format!("catalog {field} decode: {e}")))
}

/// Direct HTTP client against the catalog's search endpoints
#[derive(Clone)]
pub struct CmrHttpClient {
    client: Client,
    base_url: String,
}

impl CmrHttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Create a client from the CMR_ENDPOINT environment variable.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("CMR_ENDPOINT")
            .map_err(|_| ServiceError::validation("CMR_ENDPOINT environment variable not set"))?;
        Ok(Self::new(base_url))
    }

    fn path_for(query_type: QueryType) -> &'static str {
        match query_type {
            QueryType::Collections => "search/collections.umm_json",
            QueryType::Variables => "search/variables.umm_json",
            QueryType::Services => "search/services.umm_json",
            QueryType::Grids => "search/grids.umm_json",
            QueryType::Visualizations => "search/visualizations.umm_json",
            QueryType::Permissions => "access-control/permissions",
            QueryType::GranuleHits => "search/granules.json",
        }
    }
}

#[async_trait]
impl CmrClient for CmrHttpClient {
    #[instrument(skip(self, token), fields(query = %query.canonical()))]
    async fn query(&self, query_type: QueryType, query: &CmrQuery, token: &str) -> Result<Value> {
        let url = format!(
            "{}/{}?{}",
            self.base_url.trim_end_matches('/'),
            Self::path_for(query_type),
            query.canonical()
        );

        let mut request = self.client.get(&url);
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ServiceError::UpstreamUnavailable(format!(
                "catalog returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ServiceError::validation(format!(
                "catalog rejected query: {status}"
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ServiceError::server(format!("catalog response decode: {e}")))
    }
}

/// Caching wrapper around any [`CmrClient`]
///
/// Responses are cached by MD5(query type, canonical query, token);
/// concurrent misses on the same key share one upstream call.
pub struct CachedCmrClient<C> {
    inner: C,
    cache: CmrCache,
}

impl<C: CmrClient> CachedCmrClient<C> {
    pub fn new(inner: C, config: CmrCacheConfig) -> Self {
        Self {
            inner,
            cache: CmrCache::new(config),
        }
    }
}

#[async_trait]
impl<C: CmrClient> CmrClient for CachedCmrClient<C> {
    async fn query(&self, query_type: QueryType, query: &CmrQuery, token: &str) -> Result<Value> {
        let key = cache_key(query_type, query, token);
        let inner = &self.inner;
        let value: Arc<Value> = self
            .cache
            .get_or_fetch(key, || async move { inner.query(query_type, query, token).await })
            .await?;
        Ok((*value).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CmrClient for CountingClient {
        async fn query(
            &self,
            _query_type: QueryType,
            _query: &CmrQuery,
            _token: &str,
        ) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"items": [{"id": "C1-PROV", "short_name": "MOD"}], "hits": 1}))
        }
    }

    #[tokio::test]
    async fn cached_client_reuses_responses_per_key() {
        let client = CachedCmrClient::new(
            CountingClient {
                calls: AtomicUsize::new(0),
            },
            CmrCacheConfig::default(),
        );
        let query = CmrQuery::new().param("concept_id", "C1-PROV");

        let first = client.collections(&query, "t").await.unwrap();
        let second = client.collections(&query, "t").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second[0].id, "C1-PROV");
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 1);

        // A different token is a different key and must not share
        client.collections(&query, "other").await.unwrap();
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 2);
    }
}
