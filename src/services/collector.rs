// src/services/collector.rs

//! Review collection from paged provider feeds.
//!
//! Walks a JSON feed page by page, extracts review items by configured dot
//! paths, and stores anything not seen before. In incremental mode the walk
//! stops at the first already-stored review; in initial mode it runs to the
//! end of the feed or the provider's page ceiling.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CollectError, Result};
use crate::models::{
    CatalogEntry, CollectStatus, CollectionMode, Config, ErrorCode, FeedConfig,
};
use crate::services::ProviderTransport;
use crate::storage::StateStore;

/// Collects reviews for one entity. The cycle runner is generic over this so
/// platform feeds and test doubles plug in the same way.
#[async_trait]
pub trait ReviewCollector: Send + Sync {
    /// Collect reviews for `entry`, storing them as it goes.
    ///
    /// Classified provider failures come back as `Ok(CollectStatus::Failed)`;
    /// `Err` is reserved for storage errors, which must reach the cycle
    /// runner unswallowed.
    async fn collect(&self, entry: &CatalogEntry, mode: CollectionMode) -> Result<CollectStatus>;
}

/// Feed-driven collector walking paged JSON documents.
pub struct FeedCollector {
    config: Arc<Config>,
    transport: Arc<ProviderTransport>,
    store: Arc<dyn StateStore>,
}

impl FeedCollector {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<ProviderTransport>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
        }
    }
}

#[async_trait]
impl ReviewCollector for FeedCollector {
    async fn collect(&self, entry: &CatalogEntry, mode: CollectionMode) -> Result<CollectStatus> {
        let Some(feed) = self.config.collection.feed(entry.platform) else {
            return Err(CollectError::config(format!(
                "no feed configured for {}",
                entry.platform
            )));
        };

        let known = self.store.review_ids(&entry.entity_id, entry.platform).await?;
        let mut total_new = 0usize;
        let mut hit_known = false;
        let mut reached_end = false;

        for page in 1..=feed.max_pages {
            let url = feed.page_url(&entry.entity_id, page);
            let outcome = self.transport.get_json(&url, entry.platform).await;
            if !outcome.success {
                let code = outcome.error_code.unwrap_or(ErrorCode::NetworkError);
                let detail = outcome
                    .error_detail
                    .unwrap_or_else(|| "request failed".into());
                return Ok(CollectStatus::Failed { code, detail });
            }
            let Some(document) = outcome.json else {
                return Ok(CollectStatus::Failed {
                    code: ErrorCode::ParseError,
                    detail: "empty response document".into(),
                });
            };

            let items = parse_page(&document, feed);
            if items.is_empty() {
                if page == 1 {
                    return Ok(CollectStatus::Failed {
                        code: ErrorCode::NoReviews,
                        detail: "feed returned no reviews".into(),
                    });
                }
                reached_end = true;
                break;
            }

            let mut batch: Vec<(String, Value)> = Vec::with_capacity(items.len());
            for (review_id, payload) in items {
                if known.contains(&review_id) {
                    if mode == CollectionMode::Incremental {
                        hit_known = true;
                        break;
                    }
                    continue;
                }
                batch.push((review_id, payload));
            }

            if !batch.is_empty() {
                total_new += self
                    .store
                    .insert_reviews(&entry.entity_id, entry.platform, &batch)
                    .await?;
            }
            if hit_known {
                log::debug!(
                    "{}: reached already-collected reviews on page {page}",
                    entry.label()
                );
                break;
            }
        }

        // Neither stop condition fired: the walk ran into the page ceiling
        // with more reviews upstream.
        let limited = !hit_known && !reached_end;
        let limited_reason = limited.then(|| ErrorCode::ApiLimitReached.as_str().to_string());
        if limited {
            log::warn!(
                "{}: stopped at the {}-page feed ceiling with more reviews upstream",
                entry.label(),
                feed.max_pages
            );
        }

        Ok(CollectStatus::Completed {
            new_reviews: total_new,
            limited,
            limited_reason,
        })
    }
}

/// Walk a dot path ("feed.entry") through nested JSON objects.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// Extract `(review_id, payload)` pairs from one feed page.
///
/// Items without an id at the configured path are dropped. A page whose item
/// node is a single object instead of an array is treated as a one-item page;
/// the App Store RSS collapses the array when only one entry remains.
fn parse_page(document: &Value, feed: &FeedConfig) -> Vec<(String, Value)> {
    let Some(node) = lookup(document, &feed.items_path) else {
        return Vec::new();
    };
    let items: Vec<&Value> = match node {
        Value::Array(array) => array.iter().collect(),
        Value::Object(_) => vec![node],
        _ => return Vec::new(),
    };

    let skip = if feed.skip_first_item { 1 } else { 0 };
    items
        .into_iter()
        .skip(skip)
        .filter_map(|item| {
            let id = match lookup(item, &feed.id_path)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            if id.is_empty() {
                return None;
            }
            Some((id, item.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rss_feed() -> FeedConfig {
        FeedConfig {
            url_template: "https://example.com/page={page}/id={entity}/json".into(),
            items_path: "feed.entry".into(),
            id_path: "id.label".into(),
            max_pages: 10,
            skip_first_item: true,
        }
    }

    fn entry(id: &str) -> Value {
        json!({
            "id": { "label": id },
            "im:rating": { "label": "5" },
            "content": { "label": "great app" }
        })
    }

    #[test]
    fn test_lookup_walks_nested_objects() {
        let doc = json!({ "feed": { "entry": [1, 2, 3] } });
        assert_eq!(lookup(&doc, "feed.entry"), Some(&json!([1, 2, 3])));
        assert_eq!(lookup(&doc, "feed.missing"), None);
        assert_eq!(lookup(&doc, "nope"), None);
    }

    #[test]
    fn test_parse_page_skips_envelope_entry() {
        // First entry of an App Store RSS page is the app itself
        let doc = json!({
            "feed": { "entry": [entry("app-envelope"), entry("r1"), entry("r2")] }
        });
        let items = parse_page(&doc, &rss_feed());
        let ids: Vec<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn test_parse_page_without_skip_keeps_everything() {
        let mut feed = rss_feed();
        feed.skip_first_item = false;
        let doc = json!({ "feed": { "entry": [entry("r1"), entry("r2")] } });
        assert_eq!(parse_page(&doc, &feed).len(), 2);
    }

    #[test]
    fn test_parse_page_collapsed_single_object() {
        let mut feed = rss_feed();
        feed.skip_first_item = false;
        let doc = json!({ "feed": { "entry": entry("only") } });
        let items = parse_page(&doc, &feed);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, "only");
    }

    #[test]
    fn test_parse_page_drops_items_without_id() {
        let mut feed = rss_feed();
        feed.skip_first_item = false;
        let doc = json!({
            "feed": { "entry": [entry("r1"), { "content": { "label": "no id" } }] }
        });
        let items = parse_page(&doc, &feed);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].0, "r1");
    }

    #[test]
    fn test_parse_page_numeric_ids_stringified() {
        let mut feed = rss_feed();
        feed.skip_first_item = false;
        let doc = json!({ "feed": { "entry": [{ "id": { "label": 12345 } }] } });
        let items = parse_page(&doc, &feed);
        assert_eq!(items[0].0, "12345");
    }

    #[test]
    fn test_parse_page_missing_items_node() {
        let doc = json!({ "feed": {} });
        assert!(parse_page(&doc, &rss_feed()).is_empty());
        let doc = json!({ "feed": { "entry": "not a list" } });
        assert!(parse_page(&doc, &rss_feed()).is_empty());
    }
}
