use foodraw_adapters::{PageError, PageRequest, PageSource, SearchPage};
use foodraw_storage::BackoffPolicy;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::warn;

use crate::config::RunParams;

/// A page that could not be fetched within the retry budget.
#[derive(Debug, Error)]
#[error("fetching page {page} (offset {offset}) failed after {attempts} attempt(s): {source}")]
pub struct FetchError {
    pub page: u32,
    pub offset: u64,
    pub attempts: u32,
    #[source]
    pub source: PageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    LimitReached,
    UpstreamExhausted,
    MaxPages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub start_page: u32,
    pub page_size: u32,
    pub limit: u64,
    pub max_pages: u32,
    pub concurrency: usize,
}

impl FetchPlan {
    /// Pages this plan may request: enough to cover `limit`, capped by `max_pages`.
    pub fn page_budget(&self) -> u32 {
        if self.page_size == 0 {
            return 0;
        }
        let needed = self.limit.div_ceil(u64::from(self.page_size));
        let needed = u32::try_from(needed).unwrap_or(u32::MAX);
        needed
            .min(self.max_pages)
            .min(u32::MAX - self.start_page.saturating_sub(1))
    }
}

impl From<&RunParams> for FetchPlan {
    fn from(params: &RunParams) -> Self {
        Self {
            start_page: params.start_page(),
            page_size: params.page_size,
            limit: params.limit,
            max_pages: params.max_pages,
            concurrency: params.concurrency,
        }
    }
}

#[derive(Debug)]
pub struct FetchedPage {
    pub request: PageRequest,
    pub count: Option<u64>,
    pub products: Vec<Box<RawValue>>,
    pub attempts: u32,
    /// Set on the final page when the limit or upstream ended the sequence.
    pub stop: Option<StopReason>,
}

/// Pages through a [`PageSource`], retrying per [`BackoffPolicy`].
pub struct Fetcher<P> {
    source: P,
    policy: BackoffPolicy,
}

impl<P: PageSource> Fetcher<P> {
    pub fn new(source: P, policy: BackoffPolicy) -> Self {
        Self { source, policy }
    }

    pub fn source(&self) -> &P {
        &self.source
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn fetch_with_retry(
        &self,
        request: PageRequest,
    ) -> Result<(SearchPage, u32), FetchError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.source.fetch_page(request).await {
                Ok(page) => return Ok((page, attempts)),
                Err(err) if err.is_retryable() && self.policy.allows_retry(attempts) => {
                    let delay = self.policy.next_delay(attempts - 1, err.retry_after());
                    warn!(
                        page = request.page,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "page fetch failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(FetchError {
                        page: request.page,
                        offset: request.offset(),
                        attempts,
                        source,
                    })
                }
            }
        }
    }

    /// Lazy page sequence in increasing offset order.
    ///
    /// Up to `plan.concurrency` pages are in flight; results are still yielded
    /// in order. The sequence ends after the first error, the page that
    /// exhausts `plan.limit`, the last upstream page, or `max_pages` pages.
    pub fn pages(&self, plan: FetchPlan) -> BoxStream<'_, Result<FetchedPage, FetchError>> {
        let requests = (0..plan.page_budget()).map(move |index| PageRequest {
            page: plan.start_page + index,
            page_size: plan.page_size,
        });
        let inner = stream::iter(requests)
            .map(move |request| self.fetch_with_retry(request))
            .buffered(plan.concurrency.max(1))
            .boxed();

        let cursor = PageCursor {
            inner,
            remaining: plan.limit,
            finished: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished || cursor.remaining == 0 {
                return None;
            }
            match cursor.inner.next().await? {
                Ok((page, attempts)) => {
                    let upstream_last = page.is_last();
                    let mut products = page.products;
                    if products.len() as u64 > cursor.remaining {
                        products.truncate(cursor.remaining as usize);
                    }
                    cursor.remaining -= products.len() as u64;

                    let stop = if cursor.remaining == 0 {
                        Some(StopReason::LimitReached)
                    } else if upstream_last {
                        Some(StopReason::UpstreamExhausted)
                    } else {
                        None
                    };
                    cursor.finished = stop.is_some();
                    let fetched = FetchedPage {
                        request: page.request,
                        count: page.count,
                        products,
                        attempts,
                        stop,
                    };
                    Some((Ok(fetched), cursor))
                }
                Err(err) => {
                    cursor.finished = true;
                    Some((Err(err), cursor))
                }
            }
        })
        .boxed()
    }
}

struct PageCursor<'a> {
    inner: BoxStream<'a, Result<(SearchPage, u32), FetchError>>,
    remaining: u64,
    finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use foodraw_adapters::parse_search_page;

    /// Serves `total` numbered products; page numbers in `failing` fail
    /// `fail_times` times before succeeding.
    struct NumberedSource {
        total: u64,
        failing: Vec<u32>,
        fail_times: usize,
        retryable: bool,
        calls: Mutex<Vec<u32>>,
        failures_served: AtomicUsize,
    }

    impl NumberedSource {
        fn new(total: u64) -> Self {
            Self {
                total,
                failing: Vec::new(),
                fail_times: 0,
                retryable: true,
                calls: Mutex::new(Vec::new()),
                failures_served: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for NumberedSource {
        fn source_id(&self) -> &str {
            "numbered"
        }

        async fn fetch_page(&self, request: PageRequest) -> Result<SearchPage, PageError> {
            self.calls.lock().unwrap().push(request.page);
            if self.failing.contains(&request.page)
                && self.failures_served.load(Ordering::SeqCst) < self.fail_times
            {
                self.failures_served.fetch_add(1, Ordering::SeqCst);
                return Err(PageError::Transport {
                    message: "connection reset".into(),
                    retryable: self.retryable,
                });
            }
            let start = request.offset();
            let end = (start + u64::from(request.page_size)).min(self.total);
            let products = (start..end)
                .map(|i| format!(r#"{{"code":"{i}"}}"#))
                .collect::<Vec<_>>()
                .join(",");
            let body = format!(r#"{{"count":{},"products":[{products}]}}"#, self.total);
            parse_search_page(request, body.as_bytes())
        }
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    fn plan(limit: u64, page_size: u32) -> FetchPlan {
        FetchPlan {
            start_page: 1,
            page_size,
            limit,
            max_pages: 50,
            concurrency: 1,
        }
    }

    async fn collect(
        fetcher: &Fetcher<NumberedSource>,
        plan: FetchPlan,
    ) -> Vec<Result<FetchedPage, FetchError>> {
        fetcher.pages(plan).collect::<Vec<_>>().await
    }

    #[test]
    fn page_budget_covers_limit_and_respects_max_pages() {
        assert_eq!(plan(300, 100).page_budget(), 3);
        assert_eq!(plan(301, 100).page_budget(), 4);
        assert_eq!(FetchPlan { max_pages: 2, ..plan(300, 100) }.page_budget(), 2);
        assert_eq!(plan(0, 100).page_budget(), 0);
    }

    #[tokio::test]
    async fn stops_when_limit_is_reached() {
        let fetcher = Fetcher::new(NumberedSource::new(1_000), fast_policy(1));
        let pages = collect(&fetcher, plan(250, 100)).await;
        let pages = pages.into_iter().map(Result::unwrap).collect::<Vec<_>>();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].products.len(), 50);
        assert_eq!(pages[2].stop, Some(StopReason::LimitReached));
        assert_eq!(*fetcher.source().calls.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stops_when_upstream_runs_out() {
        let fetcher = Fetcher::new(NumberedSource::new(120), fast_policy(1));
        let pages = collect(&fetcher, plan(1_000, 50)).await;
        let pages = pages.into_iter().map(Result::unwrap).collect::<Vec<_>>();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[2].products.len(), 20);
        assert_eq!(pages[2].stop, Some(StopReason::UpstreamExhausted));
    }

    #[tokio::test]
    async fn max_pages_ends_without_stop_marker() {
        let fetcher = Fetcher::new(NumberedSource::new(1_000), fast_policy(1));
        let pages = collect(&fetcher, FetchPlan { max_pages: 2, ..plan(500, 100) }).await;
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.as_ref().unwrap().stop.is_none()));
    }

    #[tokio::test]
    async fn transient_failures_within_budget_are_retried() {
        let source = NumberedSource {
            failing: vec![2],
            fail_times: 2,
            ..NumberedSource::new(300)
        };
        let fetcher = Fetcher::new(source, fast_policy(3));
        let pages = collect(&fetcher, plan(300, 100)).await;
        let pages = pages.into_iter().map(Result::unwrap).collect::<Vec<_>>();

        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].attempts, 3);
        assert_eq!(*fetcher.source().calls.lock().unwrap(), vec![1, 2, 2, 2, 3]);
    }

    #[tokio::test]
    async fn exhausted_retries_name_the_failing_page() {
        let source = NumberedSource {
            failing: vec![3],
            fail_times: usize::MAX,
            ..NumberedSource::new(1_000)
        };
        let fetcher = Fetcher::new(source, fast_policy(4));
        let pages = collect(&fetcher, plan(500, 100)).await;

        assert_eq!(pages.len(), 3);
        let err = pages[2].as_ref().unwrap_err();
        assert_eq!(err.page, 3);
        assert_eq!(err.offset, 200);
        assert_eq!(err.attempts, 4);
    }

    #[tokio::test]
    async fn non_retryable_failures_are_not_retried() {
        let source = NumberedSource {
            failing: vec![1],
            fail_times: usize::MAX,
            retryable: false,
            ..NumberedSource::new(1_000)
        };
        let fetcher = Fetcher::new(source, fast_policy(5));
        let pages = collect(&fetcher, plan(100, 100)).await;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].as_ref().unwrap_err().attempts, 1);
    }

    #[tokio::test]
    async fn prefetch_keeps_offset_order() {
        let fetcher = Fetcher::new(NumberedSource::new(1_000), fast_policy(1));
        let pages = collect(&fetcher, FetchPlan { concurrency: 4, ..plan(600, 100) }).await;
        let offsets = pages
            .iter()
            .map(|p| p.as_ref().unwrap().request.offset())
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 100, 200, 300, 400, 500]);
    }

    #[tokio::test]
    async fn resumes_from_start_page() {
        let fetcher = Fetcher::new(NumberedSource::new(1_000), fast_policy(1));
        let pages = collect(&fetcher, FetchPlan { start_page: 3, ..plan(200, 100) }).await;
        let first = pages[0].as_ref().unwrap();
        assert_eq!(first.request.page, 3);
        assert_eq!(first.products[0].get(), r#"{"code":"200"}"#);
    }
}
