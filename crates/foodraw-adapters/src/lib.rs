//! Upstream page sources: the `PageSource` contract and the Open Food Facts
//! search v2 client.

use std::time::Duration;

use async_trait::async_trait;
use foodraw_storage::{
    classify_reqwest_error, classify_status, HttpFetcher, RetryDisposition,
};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "foodraw-adapters";

pub const OFF_DEFAULT_BASE_URL: &str = "https://world.openfoodfacts.org";
pub const OFF_SEARCH_PATH: &str = "/api/v2/search";

/// One 1-based page of a paginated search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// Products of one page, each kept as the exact JSON text received.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub request: PageRequest,
    /// Total number of matches reported upstream, when present.
    pub count: Option<u64>,
    pub products: Vec<Box<RawValue>>,
}

impl SearchPage {
    /// Whether upstream has nothing after this page.
    pub fn is_last(&self) -> bool {
        if self.products.is_empty() || self.products.len() < self.request.page_size as usize {
            return true;
        }
        match self.count {
            Some(count) => self.request.offset() + self.products.len() as u64 >= count,
            None => false,
        }
    }
}

/// Failure of a single page attempt.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },
    #[error("http status {status} from {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("malformed search response: {0}")]
    Malformed(String),
}

impl PageError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            PageError::Transport { retryable: true, .. } => RetryDisposition::Retryable,
            PageError::Transport { .. } => RetryDisposition::NonRetryable,
            PageError::HttpStatus { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            PageError::Malformed(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PageError::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for PageError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = classify_reqwest_error(&err) == RetryDisposition::Retryable;
        PageError::Transport {
            message: err.to_string(),
            retryable,
        }
    }
}

/// A paginated upstream that yields raw product payloads.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_page(&self, request: PageRequest) -> Result<SearchPage, PageError>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for std::sync::Arc<T> {
    fn source_id(&self) -> &str {
        (**self).source_id()
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<SearchPage, PageError> {
        (**self).fetch_page(request).await
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    count: Option<JsonValue>,
    #[serde(default)]
    products: Option<Vec<Box<RawValue>>>,
}

fn json_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a search v2 response body. `products` must be an array.
pub fn parse_search_page(request: PageRequest, body: &[u8]) -> Result<SearchPage, PageError> {
    let envelope: SearchEnvelope = serde_json::from_slice(body)
        .map_err(|err| PageError::Malformed(format!("page {}: {err}", request.page)))?;
    let products = envelope.products.ok_or_else(|| {
        PageError::Malformed(format!("page {}: response missing 'products' list", request.page))
    })?;
    Ok(SearchPage {
        request,
        count: envelope.count.as_ref().and_then(json_count),
        products,
    })
}

/// Open Food Facts `/api/v2/search` client.
#[derive(Debug)]
pub struct OffSearchClient {
    http: HttpFetcher,
    base_url: String,
    source_id: String,
    category_en: Option<String>,
}

impl OffSearchClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            source_id: source_id.into(),
            category_en: None,
        }
    }

    /// Restrict results to an English category name such as "Snacks".
    pub fn with_category(mut self, category_en: Option<String>) -> Self {
        self.category_en = category_en.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn search_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), OFF_SEARCH_PATH)
    }

    pub fn query_for(&self, request: PageRequest) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("page", request.page.to_string()),
            ("page_size", request.page_size.to_string()),
            // Stable ordering across pages; full payloads, so no `fields=`.
            ("sort_by", "last_modified_t".to_string()),
        ];
        if let Some(category) = &self.category_en {
            query.push(("categories_tags_en", category.clone()));
        }
        query
    }
}

#[async_trait]
impl PageSource for OffSearchClient {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<SearchPage, PageError> {
        let url = self.search_url();
        let resp = self.http.get(&url, &self.query_for(request)).await?;
        if !resp.status.is_success() {
            return Err(PageError::HttpStatus {
                status: resp.status.as_u16(),
                url: resp.final_url,
                retry_after: resp.retry_after,
            });
        }
        let page = parse_search_page(request, &resp.body)?;
        debug!(page = request.page, products = page.products.len(), count = ?page.count, "search page parsed");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use foodraw_storage::HttpClientConfig;

    const UA: &str = "foodraw-tests/0.1 (data-team@example.org)";

    fn req(page: u32, page_size: u32) -> PageRequest {
        PageRequest { page, page_size }
    }

    #[test]
    fn offsets_are_zero_based_from_one_based_pages() {
        assert_eq!(req(1, 100).offset(), 0);
        assert_eq!(req(3, 100).offset(), 200);
    }

    #[test]
    fn products_are_captured_verbatim() {
        let body = br#"{"count": 2, "page": 1, "products": [ {"code" : "1", "x": 1.50}, {"code":"2"} ]}"#;
        let page = parse_search_page(req(1, 2), body).unwrap();
        assert_eq!(page.count, Some(2));
        assert_eq!(page.products[0].get(), r#"{"code" : "1", "x": 1.50}"#);
        assert_eq!(page.products[1].get(), r#"{"code":"2"}"#);
        assert!(page.is_last());
    }

    #[test]
    fn missing_products_is_malformed() {
        let err = parse_search_page(req(4, 10), br#"{"count": 0}"#).unwrap_err();
        assert!(matches!(err, PageError::Malformed(ref m) if m.contains("missing 'products'")));
        assert!(!err.is_retryable());

        let err = parse_search_page(req(4, 10), br#"{"products": {"a": 1}}"#).unwrap_err();
        assert!(matches!(err, PageError::Malformed(_)));
    }

    #[test]
    fn string_counts_are_accepted() {
        let page = parse_search_page(req(1, 1), br#"{"count": "5", "products": [{}]}"#).unwrap();
        assert_eq!(page.count, Some(5));
        assert!(!page.is_last());
    }

    #[test]
    fn short_or_empty_pages_are_last() {
        let page = parse_search_page(req(2, 3), br#"{"products": [{}, {}]}"#).unwrap();
        assert!(page.is_last());
        let page = parse_search_page(req(2, 3), br#"{"products": []}"#).unwrap();
        assert!(page.is_last());
        let page = parse_search_page(req(2, 2), br#"{"count": 4, "products": [{}, {}]}"#).unwrap();
        assert!(page.is_last());
    }

    #[test]
    fn page_errors_classify_for_retry() {
        let throttled = PageError::HttpStatus {
            status: 429,
            url: "u".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(2)));
        let missing = PageError::HttpStatus {
            status: 404,
            url: "u".into(),
            retry_after: None,
        };
        assert!(!missing.is_retryable());
    }

    #[derive(Clone, Default)]
    struct FakeOff {
        hits: Arc<AtomicUsize>,
        seen: Arc<std::sync::Mutex<Vec<(HashMap<String, String>, String)>>>,
    }

    async fn search(
        State(state): State<FakeOff>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        state.hits.fetch_add(1, Ordering::SeqCst);
        let ua = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        state.seen.lock().unwrap().push((params.clone(), ua));
        match params.get("page").map(String::as_str) {
            Some("1") => (
                [("content-type", "application/json")],
                r#"{"count":3,"page":1,"page_size":2,"products":[{"code":"a"},{"code":"b"}]}"#,
            )
                .into_response(),
            Some("2") => (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response(),
            Some("3") => (StatusCode::TOO_MANY_REQUESTS, [("retry-after", "7")], "slow down")
                .into_response(),
            _ => (StatusCode::NOT_FOUND, "nope").into_response(),
        }
    }

    async fn spawn_fake_off() -> (String, FakeOff) {
        let state = FakeOff::default();
        let app = Router::new()
            .route("/api/v2/search", get(search))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), state)
    }

    fn client(base_url: &str) -> OffSearchClient {
        let http = HttpFetcher::new(HttpClientConfig::new(UA)).unwrap();
        OffSearchClient::new(http, base_url, "openfoodfacts")
            .with_category(Some("Snacks".to_string()))
    }

    #[tokio::test]
    async fn client_sends_paging_params_and_user_agent() {
        let (base_url, state) = spawn_fake_off().await;
        let client = client(&base_url);
        let page = client.fetch_page(req(1, 2)).await.unwrap();

        assert_eq!(page.products.len(), 2);
        assert_eq!(page.count, Some(3));
        let seen = state.seen.lock().unwrap();
        let (params, ua) = &seen[0];
        assert_eq!(params.get("page_size").map(String::as_str), Some("2"));
        assert_eq!(params.get("sort_by").map(String::as_str), Some("last_modified_t"));
        assert_eq!(params.get("categories_tags_en").map(String::as_str), Some("Snacks"));
        assert!(!params.contains_key("fields"));
        assert_eq!(ua, UA);
    }

    #[tokio::test]
    async fn client_surfaces_server_errors_as_retryable() {
        let (base_url, _state) = spawn_fake_off().await;
        let err = client(&base_url).fetch_page(req(2, 2)).await.unwrap_err();
        assert!(matches!(err, PageError::HttpStatus { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_reads_retry_after_on_throttling() {
        let (base_url, _state) = spawn_fake_off().await;
        let err = client(&base_url).fetch_page(req(3, 2)).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_treats_not_found_as_fatal() {
        let (base_url, _state) = spawn_fake_off().await;
        let err = client(&base_url).fetch_page(req(9, 2)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn blank_category_is_ignored() {
        let http = HttpFetcher::new(HttpClientConfig::new(UA)).unwrap();
        let client = OffSearchClient::new(http, "https://example.org/", "off")
            .with_category(Some("  ".into()));
        assert_eq!(client.search_url(), "https://example.org/api/v2/search");
        assert!(client
            .query_for(req(1, 10))
            .iter()
            .all(|(k, _)| *k != "categories_tags_en"));
    }
}
