//! Paginated resource fetching for one platform.
//!
//! A [`Fetcher`] owns one platform's session and drives the full request
//! cycle: build the request, sign it against the live session, pick a proxy,
//! execute, feed the outcome back to the proxy pool and parse the
//! envelope. Retries re-enter the cycle from the top so every attempt
//! carries a fresh signature, possibly through a different proxy.
//!
//! Pagination walks cursors until the platform reports exhaustion, the
//! caller's quota fills, or the cursor stops advancing (a hostile API's
//! way of saying the same thing twice). A randomized pause separates
//! consecutive pages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{CrawlError, ErrorKind};
use crate::platform::{ItemRef, Platform, PlatformAdapter, RequestSpec, Resource};
use crate::proxy::ProxyPool;
use crate::retry::RetryPolicy;
use crate::session::{SecretProvider, Session};
use crate::transport::{Envelope, TransportClient};

/// Pause inserted between consecutive page fetches.
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Random wait window between pages.
    pub page_interval: (Duration, Duration),
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            page_interval: (Duration::from_secs(1), Duration::from_secs(3)),
        }
    }
}

impl Pacing {
    /// A pacing profile with no waits, for tests and captive endpoints.
    #[must_use]
    pub fn none() -> Self {
        Self {
            page_interval: (Duration::ZERO, Duration::ZERO),
        }
    }

    fn draw(&self) -> Duration {
        let (low, high) = self.page_interval;
        if high <= low {
            return low;
        }
        low + (high - low).mul_f64(rand::thread_rng().r#gen::<f64>())
    }
}

/// One platform's crawl client.
pub struct Fetcher {
    platform: Platform,
    adapter: &'static dyn PlatformAdapter,
    session: Mutex<Session>,
    transport: Arc<TransportClient>,
    proxies: Arc<ProxyPool>,
    secrets: Arc<dyn SecretProvider>,
    retry: RetryPolicy,
    pacing: Pacing,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Creates a fetcher owning `session` for `platform`.
    #[must_use]
    pub fn new(
        platform: Platform,
        session: Session,
        transport: Arc<TransportClient>,
        proxies: Arc<ProxyPool>,
        secrets: Arc<dyn SecretProvider>,
        retry: RetryPolicy,
        pacing: Pacing,
    ) -> Self {
        Self {
            platform,
            adapter: platform.adapter(),
            session: Mutex::new(session),
            transport,
            proxies,
            secrets,
            retry,
            pacing,
        }
    }

    /// The platform this fetcher serves.
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Extracts follow-up item references from raw list items.
    #[must_use]
    pub fn item_refs(&self, resource: Resource, items: &[Value]) -> Vec<ItemRef> {
        self.adapter.item_refs(resource, items)
    }

    /// Verifies the session still authenticates.
    ///
    /// # Errors
    ///
    /// The classified error the probe came back with; `AuthInvalid` means
    /// the session needs a fresh login.
    #[instrument(skip(self), fields(platform = %self.platform))]
    pub async fn ping(&self) -> Result<(), CrawlError> {
        self.execute(|| self.adapter.ping_request(), None).await?;
        Ok(())
    }

    /// Searches posts by keyword, collecting up to `limit` raw items
    /// across pages.
    ///
    /// # Errors
    ///
    /// The first non-retryable (or retry-exhausted) error of any page.
    #[instrument(skip(self), fields(platform = %self.platform, keyword))]
    pub async fn search(&self, keyword: &str, limit: usize) -> Result<Vec<Value>, CrawlError> {
        self.collect_pages(limit, |cursor| self.adapter.search_request(keyword, cursor))
            .await
    }

    /// Fetches one post/video detail document.
    ///
    /// # Errors
    ///
    /// `NotFound` for removed content, otherwise as classified.
    #[instrument(skip(self, item), fields(platform = %self.platform, item = %item.id))]
    pub async fn post_detail(&self, item: &ItemRef) -> Result<Value, CrawlError> {
        let envelope = self
            .execute(|| self.adapter.detail_request(item), None)
            .await?;
        Ok(envelope.data)
    }

    /// Fetches comments for one post as a flat list: up to `limit` root
    /// comments in page order, each followed by up to `sub_limit` of its
    /// sub-comments when `include_sub_comments` is set. The two quotas are
    /// independent; a comment-heavy root never starves the roots after it.
    /// The tree is two levels deep; sub-comments of sub-comments do not
    /// exist upstream.
    ///
    /// # Errors
    ///
    /// The first non-retryable error of any page, root or sub.
    #[instrument(skip(self, item), fields(platform = %self.platform, item = %item.id))]
    pub async fn comments(
        &self,
        item: &ItemRef,
        limit: usize,
        sub_limit: usize,
        include_sub_comments: bool,
    ) -> Result<Vec<Value>, CrawlError> {
        let roots = self
            .collect_pages(limit, |cursor| self.adapter.comments_request(item, cursor))
            .await?;
        if !include_sub_comments || sub_limit == 0 {
            return Ok(roots);
        }

        let mut all = Vec::with_capacity(roots.len());
        for root in roots {
            all.push(root.clone());
            if !self.adapter.root_has_sub_comments(&root) {
                continue;
            }
            self.pace().await;
            let subs = self
                .collect_pages(sub_limit, |cursor| {
                    self.adapter.sub_comments_request(item, &root, cursor)
                })
                .await?;
            all.extend(subs);
        }
        Ok(all)
    }

    /// Lists up to `limit` posts from a creator profile.
    ///
    /// # Errors
    ///
    /// The first non-retryable error of any page.
    #[instrument(skip(self), fields(platform = %self.platform, creator_id))]
    pub async fn creator_posts(
        &self,
        creator_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>, CrawlError> {
        self.collect_pages(limit, |cursor| {
            self.adapter.creator_posts_request(creator_id, cursor)
        })
        .await
    }

    /// Fetches one creator profile document.
    ///
    /// # Errors
    ///
    /// `NotFound` for missing creators, otherwise as classified.
    #[instrument(skip(self), fields(platform = %self.platform, creator_id))]
    pub async fn creator_info(&self, creator_id: &str) -> Result<Value, CrawlError> {
        let envelope = self
            .execute(|| self.adapter.creator_info_request(creator_id), None)
            .await?;
        Ok(envelope.data)
    }

    /// Cursor loop shared by every paginated resource.
    async fn collect_pages<F>(&self, limit: usize, build: F) -> Result<Vec<Value>, CrawlError>
    where
        F: Fn(Option<&str>) -> RequestSpec + Sync,
    {
        let mut out: Vec<Value> = Vec::new();
        let mut cursor: Option<String> = None;
        if limit == 0 {
            return Ok(out);
        }
        loop {
            let envelope = self
                .execute(|| build(cursor.as_deref()), cursor.as_deref())
                .await?;
            let got = envelope.items.len();
            out.extend(envelope.items);
            if out.len() >= limit {
                out.truncate(limit);
                debug!(collected = out.len(), "quota reached, stopping pagination");
                return Ok(out);
            }
            match envelope.next_cursor {
                // A cursor that fails to advance would loop forever.
                Some(next) if Some(next.as_str()) != cursor.as_deref() && got > 0 => {
                    cursor = Some(next);
                }
                _ => return Ok(out),
            }
            self.pace().await;
        }
    }

    /// One signed, proxied, retried request.
    async fn execute<F>(
        &self,
        build: F,
        current_cursor: Option<&str>,
    ) -> Result<Envelope, CrawlError>
    where
        F: Fn() -> RequestSpec + Sync,
    {
        let label = format!("{}:{}", self.platform, resource_label(build().resource));
        let this = self;
        let build = &build;
        self.retry
            .run(&label, move |_attempt| async move {
                // Sign fresh inside the attempt so retries never replay a
                // stale signature.
                let spec = build();
                let signed = {
                    let mut session = this.session.lock().await;
                    this.adapter
                        .sign(&mut session, spec, this.secrets.as_ref())
                        .await?
                };
                let proxy = this.proxies.select(this.platform);

                let started = Instant::now();
                let raw = match this.transport.execute(&signed, proxy.as_ref()).await {
                    Ok(raw) => raw,
                    Err(error) => {
                        if let Some(endpoint) = &proxy {
                            this.proxies.record_failure(endpoint.id);
                        }
                        return Err(error);
                    }
                };
                let round_trip = started.elapsed();

                let parsed = this.adapter.parse_envelope(signed.resource, &raw, current_cursor);
                if let Some(endpoint) = &proxy {
                    // A block means the exit address is burned; anything
                    // else says the proxy itself carried the request fine.
                    match &parsed {
                        Err(error) if error.kind() == ErrorKind::IpBlocked => {
                            this.proxies.record_failure(endpoint.id);
                        }
                        _ => this.proxies.record_success(endpoint.id, round_trip),
                    }
                }
                parsed
            })
            .await
    }

    async fn pace(&self) {
        let wait = self.pacing.draw();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

fn resource_label(resource: Resource) -> &'static str {
    match resource {
        Resource::SearchPosts => "search",
        Resource::PostDetail => "detail",
        Resource::Comments => "comments",
        Resource::SubComments => "sub_comments",
        Resource::CreatorPosts => "creator_posts",
        Resource::CreatorInfo => "creator_info",
        Resource::Ping => "ping",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_draw_stays_in_window() {
        let pacing = Pacing {
            page_interval: (Duration::from_millis(10), Duration::from_millis(20)),
        };
        for _ in 0..100 {
            let wait = pacing.draw();
            assert!(wait >= Duration::from_millis(10));
            assert!(wait <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_pacing_none_is_zero() {
        assert!(Pacing::none().draw().is_zero());
    }

    #[test]
    fn test_degenerate_window_returns_low_bound() {
        let pacing = Pacing {
            page_interval: (Duration::from_millis(5), Duration::from_millis(5)),
        };
        assert_eq!(pacing.draw(), Duration::from_millis(5));
    }
}
