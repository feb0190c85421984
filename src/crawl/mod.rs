//! Crawl entry point: modes, record sink and the run summary.
//!
//! [`run_crawl`] is the one way in. It hydrates a platform fetcher from
//! the context, probes the session, walks the requested mode (keyword
//! search, specified posts, or creator profiles), fans detail and comment
//! fetching out through the batch scheduler, and hands every collected
//! record to the injected [`RecordSink`]. Per-item failures land in the
//! summary and never abort the job; only setup failures (unreachable
//! session store) error out of the entry point itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::batch::BatchScheduler;
use crate::context::CrawlContext;
use crate::error::{CrawlError, ErrorKind};
use crate::fetch::Fetcher;
use crate::platform::{ItemRef, Platform, Resource};

/// What a saved record contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A post/video listing item or detail document.
    Post,
    /// A comment, root or sub.
    Comment,
    /// A creator profile document.
    Creator,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Creator => "creator",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by the storage collaborator.
#[derive(Debug, Error)]
#[error("record sink rejected {count} {kind} item(s) for {platform}: {reason}")]
pub struct SinkError {
    pub platform: Platform,
    pub kind: RecordKind,
    pub count: usize,
    pub reason: String,
}

impl SinkError {
    pub fn new(
        platform: Platform,
        kind: RecordKind,
        count: usize,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            kind,
            count,
            reason: reason.into(),
        }
    }
}

/// Storage collaborator capability. Receives raw platform documents and
/// per-item terminal errors; durability is its problem, not the crawler's.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persists a batch of records of one kind.
    ///
    /// # Errors
    ///
    /// [`SinkError`] when the batch was rejected; the crawl records the
    /// rejection and keeps going.
    async fn save(
        &self,
        platform: Platform,
        kind: RecordKind,
        items: &[Value],
    ) -> Result<(), SinkError>;

    /// Records a terminal per-item error.
    async fn save_failure(&self, platform: Platform, item_id: &str, error: &CrawlError);
}

/// In-memory sink for tests and the CLI's dry-run output.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: std::sync::Mutex<Vec<(Platform, RecordKind, Value)>>,
    failures: std::sync::Mutex<Vec<(Platform, String, String)>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything saved so far, in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<(Platform, RecordKind, Value)> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Recorded per-item failures as `(platform, item_id, message)`.
    #[must_use]
    pub fn failures(&self) -> Vec<(Platform, String, String)> {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn save(
        &self,
        platform: Platform,
        kind: RecordKind,
        items: &[Value],
    ) -> Result<(), SinkError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records.extend(items.iter().map(|item| (platform, kind, item.clone())));
        Ok(())
    }

    async fn save_failure(&self, platform: Platform, item_id: &str, error: &CrawlError) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((platform, item_id.to_string(), error.to_string()));
    }
}

/// What to crawl.
#[derive(Debug, Clone)]
pub enum CrawlMode {
    /// Keyword search, then details and comments for the hits.
    Search { keywords: Vec<String> },
    /// Specific posts by platform-native id.
    Detail { ids: Vec<String> },
    /// Creator profiles and their post listings.
    Creator { creator_ids: Vec<String> },
}

/// One crawl job.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub platform: Platform,
    pub mode: CrawlMode,
    /// Session-store account to crawl under; `None` for the default
    /// stored session.
    pub account_id: Option<String>,
}

/// A terminal per-item failure.
#[derive(Debug, Clone)]
pub struct CrawlFailure {
    /// Post id, creator id or keyword the failure belongs to.
    pub item_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub platform: Platform,
    /// Posts/videos collected (listing items; details don't double-count).
    pub item_count: usize,
    /// Comments collected across all items.
    pub comment_count: usize,
    /// Creator profiles collected.
    pub creator_count: usize,
    pub failures: Vec<CrawlFailure>,
    /// Set when the session was rejected as unauthenticated.
    pub auth_invalid: bool,
    /// Set when shutdown interrupted the run.
    pub cancelled: bool,
}

impl CrawlSummary {
    fn new(platform: Platform) -> Self {
        Self {
            platform,
            item_count: 0,
            comment_count: 0,
            creator_count: 0,
            failures: Vec::new(),
            auth_invalid: false,
            cancelled: false,
        }
    }

    /// Number of terminal per-item failures.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    async fn record_failure(
        &mut self,
        sink: &Arc<dyn RecordSink>,
        item_id: &str,
        error: &CrawlError,
    ) {
        if error.kind() == ErrorKind::AuthInvalid {
            warn!(platform = %self.platform, item_id, "session rejected as unauthenticated: {error}");
            self.auth_invalid = true;
        }
        sink.save_failure(self.platform, item_id, error).await;
        self.failures.push(CrawlFailure {
            item_id: item_id.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

/// Runs one crawl job to completion or shutdown.
///
/// # Errors
///
/// Only setup failures: an unreachable session store. Everything after
/// setup is absorbed into the summary.
#[instrument(skip(ctx), fields(platform = %request.platform))]
pub async fn run_crawl(
    ctx: &CrawlContext,
    request: CrawlRequest,
) -> Result<CrawlSummary, CrawlError> {
    let shutdown = ctx.shutdown();
    tokio::select! {
        summary = execute(ctx, &request) => summary,
        () = wait_for_shutdown(shutdown) => {
            // Dropping the in-flight future tears down its join sets,
            // which aborts every running task.
            warn!(platform = %request.platform, "shutdown requested, crawl aborted");
            let mut summary = CrawlSummary::new(request.platform);
            summary.cancelled = true;
            Ok(summary)
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone means shutdown can never be requested.
            std::future::pending::<()>().await;
        }
    }
}

async fn execute(ctx: &CrawlContext, request: &CrawlRequest) -> Result<CrawlSummary, CrawlError> {
    let config = ctx.config().clone();
    let sink = Arc::clone(ctx.sink());
    let mut summary = CrawlSummary::new(request.platform);
    let fetcher = Arc::new(
        ctx.fetcher(request.platform, request.account_id.as_deref())
            .await?,
    );

    // Cheap probe before spending the crawl budget on a dead session.
    if let Err(error) = fetcher.ping().await {
        if error.kind() == ErrorKind::AuthInvalid {
            summary.record_failure(&sink, "session", &error).await;
            return Ok(summary);
        }
        warn!(platform = %request.platform, "liveness probe failed, continuing: {error}");
    }

    let scheduler = BatchScheduler::new(config.batch_config());

    let item_refs = match &request.mode {
        CrawlMode::Search { keywords } => {
            let refs = collect_search(&fetcher, &sink, &mut summary, keywords, config.max_notes)
                .await;
            fetch_details(&fetcher, &scheduler, &sink, &mut summary, &refs).await;
            refs
        }
        CrawlMode::Detail { ids } => {
            let refs: Vec<ItemRef> = ids.iter().map(ItemRef::new).collect();
            fetch_details(&fetcher, &scheduler, &sink, &mut summary, &refs).await;
            summary.item_count = summary
                .item_count
                .max(refs.len().saturating_sub(summary.error_count()));
            refs
        }
        CrawlMode::Creator { creator_ids } => {
            collect_creators(&fetcher, &sink, &mut summary, creator_ids, config.max_notes).await
        }
    };

    if config.enable_comments && !item_refs.is_empty() {
        fetch_comments(
            &fetcher,
            &scheduler,
            &sink,
            &mut summary,
            &item_refs,
            config.max_comments_per_item,
            config.max_sub_comments_per_item,
            config.enable_sub_comments,
        )
        .await;
    }

    info!(
        platform = %request.platform,
        items = summary.item_count,
        comments = summary.comment_count,
        creators = summary.creator_count,
        errors = summary.error_count(),
        "crawl finished"
    );
    Ok(summary)
}

/// Search phase: one keyword at a time, sharing the post quota.
async fn collect_search(
    fetcher: &Arc<Fetcher>,
    sink: &Arc<dyn RecordSink>,
    summary: &mut CrawlSummary,
    keywords: &[String],
    max_notes: usize,
) -> Vec<ItemRef> {
    let mut refs = Vec::new();
    for keyword in keywords {
        if refs.len() >= max_notes {
            break;
        }
        match fetcher.search(keyword, max_notes - refs.len()).await {
            Ok(items) => {
                summary.item_count += items.len();
                save_batch(sink, summary, RecordKind::Post, &items).await;
                refs.extend(fetcher.item_refs(Resource::SearchPosts, &items));
            }
            Err(error) => summary.record_failure(sink, keyword, &error).await,
        }
    }
    refs
}

/// Creator phase: profile document, then the post listing.
async fn collect_creators(
    fetcher: &Arc<Fetcher>,
    sink: &Arc<dyn RecordSink>,
    summary: &mut CrawlSummary,
    creator_ids: &[String],
    max_notes: usize,
) -> Vec<ItemRef> {
    let mut refs = Vec::new();
    for creator_id in creator_ids {
        match fetcher.creator_info(creator_id).await {
            Ok(profile) => {
                summary.creator_count += 1;
                save_batch(sink, summary, RecordKind::Creator, std::slice::from_ref(&profile))
                    .await;
            }
            Err(error) => summary.record_failure(sink, creator_id, &error).await,
        }
        match fetcher.creator_posts(creator_id, max_notes).await {
            Ok(items) => {
                summary.item_count += items.len();
                save_batch(sink, summary, RecordKind::Post, &items).await;
                refs.extend(fetcher.item_refs(Resource::CreatorPosts, &items));
            }
            Err(error) => summary.record_failure(sink, creator_id, &error).await,
        }
    }
    refs
}

/// Detail phase, batched.
async fn fetch_details(
    fetcher: &Arc<Fetcher>,
    scheduler: &BatchScheduler,
    sink: &Arc<dyn RecordSink>,
    summary: &mut CrawlSummary,
    refs: &[ItemRef],
) {
    if refs.is_empty() {
        return;
    }
    let tasks = refs.iter().cloned().map(|item| {
        let fetcher = Arc::clone(fetcher);
        async move { fetcher.post_detail(&item).await }
    });
    let report = scheduler.run("post_detail", tasks).await;
    let details: Vec<Value> = report
        .successes
        .into_iter()
        .map(|(_, detail)| detail)
        .collect();
    save_batch(sink, summary, RecordKind::Post, &details).await;
    for (index, error) in report.failures {
        let item_id = refs.get(index).map_or("?", |r| r.id.as_str());
        summary.record_failure(sink, item_id, &error).await;
    }
}

/// Comment phase, batched; each task walks one post's comment tree.
async fn fetch_comments(
    fetcher: &Arc<Fetcher>,
    scheduler: &BatchScheduler,
    sink: &Arc<dyn RecordSink>,
    summary: &mut CrawlSummary,
    refs: &[ItemRef],
    max_comments: usize,
    max_sub_comments: usize,
    include_sub_comments: bool,
) {
    let tasks = refs.iter().cloned().map(|item| {
        let fetcher = Arc::clone(fetcher);
        async move {
            fetcher
                .comments(&item, max_comments, max_sub_comments, include_sub_comments)
                .await
        }
    });
    let report = scheduler.run("comments", tasks).await;
    for (_, comments) in report.successes {
        summary.comment_count += comments.len();
        save_batch(sink, summary, RecordKind::Comment, &comments).await;
    }
    for (index, error) in report.failures {
        let item_id = refs.get(index).map_or("?", |r| r.id.as_str());
        summary.record_failure(sink, item_id, &error).await;
    }
}

async fn save_batch(
    sink: &Arc<dyn RecordSink>,
    summary: &mut CrawlSummary,
    kind: RecordKind,
    items: &[Value],
) {
    if items.is_empty() {
        return;
    }
    if let Err(error) = sink.save(summary.platform, kind, items).await {
        warn!(platform = %summary.platform, %kind, "sink rejected batch: {error}");
        summary.failures.push(CrawlFailure {
            item_id: format!("sink:{kind}"),
            kind: ErrorKind::Unclassified,
            message: error.to_string(),
        });
    }
}
