//! Authenticated, paginated GET access to the remote task-board API.
//!
//! There is no retry or backoff here: a failed request surfaces to the caller,
//! which decides whether to abort or skip.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};

/// Maximum number of response-body characters kept in an `Error::Api`.
const ERROR_BODY_LIMIT: usize = 800;

/// One page of a paginated remote collection: `{count, results}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub results: Vec<Value>,
}

impl Page {
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// A source of remote JSON pages.
///
/// `fetch_page` issues one request; `fetch_all_pages` walks `page=1..` until a
/// short page (fewer than `page_size` results) comes back or `max_pages` is hit.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_page(&self, endpoint: &str, params: &[(String, String)]) -> Result<Value>;

    async fn fetch_all_pages(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        page_size: u32,
        max_pages: u32,
    ) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        for page in 1..=max_pages {
            let mut query = params.to_vec();
            query.push(("page".into(), page.to_string()));
            query.push(("page_size".into(), page_size.to_string()));
            let results = Page::from_value(self.fetch_page(endpoint, &query).await?)?.results;
            let short = (results.len() as u32) < page_size;
            all.extend(results);
            if short {
                break;
            }
        }
        Ok(all)
    }
}

/// `reqwest`-backed client. Endpoints may be absolute URLs or paths relative
/// to the base URL, and may carry their own query string.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Option<Url>,
}

impl ApiClient {
    pub fn new(base_url: Option<&str>, token: &str, timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let auth = format!("Bearer {}", token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth)
                .map_err(|e| Error::Config(format!("invalid API token: {e}")))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("boardsync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        let base_url = base_url
            .map(|b| {
                // A trailing slash makes `join` append rather than replace the last segment.
                let b = if b.ends_with('/') { b.to_string() } else { format!("{b}/") };
                Url::parse(&b).map_err(|e| Error::Config(format!("invalid base URL {b}: {e}")))
            })
            .transpose()?;

        Ok(Self { http, base_url })
    }

    fn resolve(&self, endpoint: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(endpoint) {
            return Ok(url);
        }
        let base = self.base_url.as_ref().ok_or_else(|| {
            Error::Config(format!("relative endpoint {endpoint} needs a base URL"))
        })?;
        base.join(endpoint.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))
    }
}

#[async_trait]
impl RemoteSource for ApiClient {
    async fn fetch_page(&self, endpoint: &str, params: &[(String, String)]) -> Result<Value> {
        let mut url = self.resolve(endpoint)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        log::debug!("GET {url}");

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body: truncate(&body, ERROR_BODY_LIMIT),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves `total` numbered items in pages, recording every request.
    struct NumberedSource {
        total: usize,
        requests: Mutex<Vec<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl RemoteSource for NumberedSource {
        async fn fetch_page(&self, _endpoint: &str, params: &[(String, String)]) -> Result<Value> {
            self.requests.lock().unwrap().push(params.to_vec());
            let get = |k: &str| {
                params
                    .iter()
                    .find(|(key, _)| key == k)
                    .and_then(|(_, v)| v.parse::<usize>().ok())
                    .unwrap_or(1)
            };
            let (page, size) = (get("page"), get("page_size"));
            let start = (page - 1) * size;
            let results: Vec<Value> = (start..(start + size).min(self.total))
                .map(|i| json!({"id": i}))
                .collect();
            Ok(json!({"count": self.total, "results": results}))
        }
    }

    #[tokio::test]
    async fn test_fetch_all_pages_stops_on_short_page() {
        let source = NumberedSource {
            total: 25,
            requests: Mutex::new(Vec::new()),
        };
        let items = source.fetch_all_pages("/boards", &[], 10, 100).await.unwrap();
        assert_eq!(items.len(), 25);
        assert_eq!(source.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_all_pages_respects_max_pages() {
        let source = NumberedSource {
            total: 100,
            requests: Mutex::new(Vec::new()),
        };
        let items = source.fetch_all_pages("/boards", &[], 10, 2).await.unwrap();
        assert_eq!(items.len(), 20);
    }

    #[test]
    fn test_resolve_relative_and_absolute_endpoints() {
        let client =
            ApiClient::new(Some("https://api.example.com/v1"), "tok", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.resolve("/webhook-logs/?full_raw_body=true").unwrap().as_str(),
            "https://api.example.com/v1/webhook-logs/?full_raw_body=true"
        );
        assert_eq!(
            client.resolve("https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );

        let no_base = ApiClient::new(None, "tok", Duration::from_secs(5)).unwrap();
        assert!(matches!(no_base.resolve("/x"), Err(Error::Config(_))));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc…");
    }
}
