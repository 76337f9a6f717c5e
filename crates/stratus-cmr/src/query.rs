// Canonical query parameters and cache keys

use std::collections::BTreeMap;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// The kind of record a query resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Collections,
    Variables,
    Services,
    Grids,
    Visualizations,
    Permissions,
    GranuleHits,
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Collections => "collections",
            Self::Variables => "variables",
            Self::Services => "services",
            Self::Grids => "grids",
            Self::Visualizations => "visualizations",
            Self::Permissions => "permissions",
            Self::GranuleHits => "granule_hits",
        };
        write!(f, "{s}")
    }
}

/// Canonicalised query parameters
///
/// Parameters live in a BTreeMap so serialisation order is deterministic
/// and two equivalent queries always produce the same cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmrQuery {
    params: BTreeMap<String, String>,
}

impl CmrQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Stable `name=value&…` form used for both the wire and the cache key.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Cache key for a query: MD5 over (query type, canonical query, token).
///
/// The token participates so responses scoped by caller permissions are
/// never shared across users.
pub fn cache_key(query_type: QueryType, query: &CmrQuery, token: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(query_type.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(query.canonical().as_bytes());
    hasher.update(b"\0");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_order_insensitive() {
        let a = CmrQuery::new().param("b", "2").param("a", "1");
        let b = CmrQuery::new().param("a", "1").param("b", "2");
        assert_eq!(a.canonical(), "a=1&b=2");
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn keys_differ_by_type_query_and_token() {
        let q = CmrQuery::new().param("concept_id", "C1-PROV");
        let base = cache_key(QueryType::Collections, &q, "token-a");
        assert_eq!(base, cache_key(QueryType::Collections, &q, "token-a"));
        assert_ne!(base, cache_key(QueryType::Variables, &q, "token-a"));
        assert_ne!(base, cache_key(QueryType::Collections, &q, "token-b"));
        assert_ne!(
            base,
            cache_key(
                QueryType::Collections,
                &CmrQuery::new().param("concept_id", "C2-PROV"),
                "token-a"
            )
        );
    }
}
