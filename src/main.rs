//! CLI entry point for the crawler.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use crawler_core::{
    CrawlContext, CrawlRequest, CrawlerConfig, MemorySink, RecordSink, SecretProvider,
    SessionStore, StaticSecretProvider, StaticSessionStore, run_crawl,
};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Log level priority: RUST_LOG env var > quiet flag > verbose flag
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let mode = args.mode().map_err(|message| anyhow::anyhow!(message))?;

    let config = match &args.config {
        Some(path) => CrawlerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CrawlerConfig::default(),
    };

    let secrets: Arc<dyn SecretProvider> = match &args.secrets {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading secrets file {}", path.display()))?;
            Arc::new(
                StaticSecretProvider::from_json(&raw)
                    .with_context(|| format!("parsing secrets file {}", path.display()))?,
            )
        }
        None => {
            warn!("no secrets file given; signing-dependent platforms will reject requests");
            Arc::new(StaticSecretProvider::default())
        }
    };

    let mut store = StaticSessionStore::new();
    if let Some(cookie) = &args.cookie {
        store = store.with_cookies(args.platform, cookie.clone());
    }
    let sessions: Arc<dyn SessionStore> = Arc::new(store);

    let sink = Arc::new(MemorySink::new());
    let sink_handle: Arc<dyn RecordSink> = Arc::clone(&sink) as Arc<dyn RecordSink>;

    let (ctx, shutdown) = CrawlContext::new(config, secrets, sessions, sink_handle);

    // First Ctrl-C requests a clean stop; a second one kills the process.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping crawl");
            let _ = shutdown.send(true);
        }
    });

    ctx.check_proxies().await;

    info!(platform = %args.platform, "crawl starting");
    let request = CrawlRequest {
        platform: args.platform,
        mode,
        account_id: args.account.clone(),
    };
    let summary = run_crawl(&ctx, request).await?;

    if args.dump {
        use std::io::Write as _;
        let mut stdout = std::io::stdout().lock();
        for (platform, kind, item) in sink.records() {
            let line = serde_json::json!({
                "platform": platform.as_str(),
                "kind": kind.as_str(),
                "record": item,
            });
            writeln!(stdout, "{line}")?;
        }
    }

    info!(
        items = summary.item_count,
        comments = summary.comment_count,
        creators = summary.creator_count,
        errors = summary.error_count(),
        cancelled = summary.cancelled,
        "crawl complete"
    );
    if summary.auth_invalid {
        anyhow::bail!("session rejected as unauthenticated; refresh cookies and secrets");
    }
    for failure in &summary.failures {
        warn!(item = %failure.item_id, kind = %failure.kind, "item failed: {}", failure.message);
    }

    Ok(())
}
