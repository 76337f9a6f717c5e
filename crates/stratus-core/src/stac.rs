//! STAC catalog fragments
//!
//! The unit of transfer between steps. The core never parses worker
//! result payloads; it only assembles catalogs whose links point at
//! artifacts in the object store. Aggregated catalogs too large for one
//! page become a chain of sibling pages linked with rel=prev / rel=next.

use serde::{Deserialize, Serialize};

pub const STAC_VERSION: &str = "1.0.0";

/// Link relation for a child item of a catalog
pub const REL_ITEM: &str = "item";
pub const REL_PREV: &str = "prev";
pub const REL_NEXT: &str = "next";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StacLink {
    pub href: String,
    pub rel: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl StacLink {
    pub fn item(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            rel: REL_ITEM.to_string(),
            mime_type: Some("application/json".to_string()),
            title: None,
        }
    }

    fn sibling(rel: &str, href: String) -> Self {
        Self {
            href,
            rel: rel.to_string(),
            mime_type: Some("application/json".to_string()),
            title: None,
        }
    }
}

/// A catalog fragment enumerating artifact URIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacCatalog {
    pub stac_version: String,
    pub id: String,
    pub description: String,
    pub links: Vec<StacLink>,
}

impl StacCatalog {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            stac_version: STAC_VERSION.to_string(),
            id: id.into(),
            description: description.into(),
            links: Vec::new(),
        }
    }

    /// Hrefs of this catalog's child items, in link order.
    pub fn item_hrefs(&self) -> Vec<&str> {
        self.links
            .iter()
            .filter(|l| l.rel == REL_ITEM)
            .map(|l| l.href.as_str())
            .collect()
    }

    pub fn link(&self, rel: &str) -> Option<&StacLink> {
        self.links.iter().find(|l| l.rel == rel)
    }
}

/// Split item hrefs into a chain of linked catalog pages.
///
/// Every page holds at most `page_size` items. Pages are linked to their
/// neighbours with rel=prev / rel=next; the head page carries no prev
/// link and the tail no next link. `page_href` maps a page index to the
/// URI the page will be stored under, so sibling links can be written
/// before the pages themselves are.
pub fn paginate<F>(
    id_prefix: &str,
    description: &str,
    item_hrefs: &[String],
    page_size: usize,
    page_href: F,
) -> Vec<StacCatalog>
where
    F: Fn(usize) -> String,
{
    let page_size = page_size.max(1);
    let page_count = item_hrefs.len().div_ceil(page_size).max(1);

    let mut pages = Vec::with_capacity(page_count);
    for (index, chunk) in item_hrefs.chunks(page_size).enumerate() {
        let mut catalog = StacCatalog::new(format!("{id_prefix}-{index}"), description);
        if index > 0 {
            catalog
                .links
                .push(StacLink::sibling(REL_PREV, page_href(index - 1)));
        }
        if index + 1 < page_count {
            catalog
                .links
                .push(StacLink::sibling(REL_NEXT, page_href(index + 1)));
        }
        catalog.links.extend(chunk.iter().map(StacLink::item));
        pages.push(catalog);
    }

    if pages.is_empty() {
        pages.push(StacCatalog::new(format!("{id_prefix}-0"), description));
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hrefs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("mem://items/item{i}.json")).collect()
    }

    #[test]
    fn single_page_has_no_sibling_links() {
        let pages = paginate("agg", "outputs", &hrefs(3), 10, |i| format!("p{i}"));
        assert_eq!(pages.len(), 1);
        assert!(pages[0].link(REL_PREV).is_none());
        assert!(pages[0].link(REL_NEXT).is_none());
        assert_eq!(pages[0].item_hrefs().len(), 3);
    }

    #[test]
    fn chain_links_head_and_tail_correctly() {
        let pages = paginate("agg", "outputs", &hrefs(4), 1, |i| format!("page{i}.json"));
        assert_eq!(pages.len(), 4);

        assert!(pages[0].link(REL_PREV).is_none());
        assert_eq!(pages[0].link(REL_NEXT).unwrap().href, "page1.json");

        assert_eq!(pages[2].link(REL_PREV).unwrap().href, "page1.json");
        assert_eq!(pages[2].link(REL_NEXT).unwrap().href, "page3.json");

        assert_eq!(pages[3].link(REL_PREV).unwrap().href, "page2.json");
        assert!(pages[3].link(REL_NEXT).is_none());
        assert_eq!(pages[3].item_hrefs(), vec!["mem://items/item3.json"]);
    }

    #[test]
    fn paging_engages_only_above_page_size() {
        assert_eq!(paginate("a", "d", &hrefs(5), 5, |i| format!("{i}")).len(), 1);
        assert_eq!(paginate("a", "d", &hrefs(6), 5, |i| format!("{i}")).len(), 2);
    }

    #[test]
    fn empty_input_yields_one_empty_page() {
        let pages = paginate("agg", "outputs", &[], 5, |i| format!("{i}"));
        assert_eq!(pages.len(), 1);
        assert!(pages[0].item_hrefs().is_empty());
    }
}
