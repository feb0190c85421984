//! Shared crawl context: configuration, collaborators and shutdown.
//!
//! One [`CrawlContext`] backs any number of crawl runs. It owns the
//! transport, the proxy pool and the injected capabilities; per-platform
//! fetchers are built on demand with sessions hydrated from the session
//! store and the secret provider. Nothing here is global state.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::config::CrawlerConfig;
use crate::crawl::RecordSink;
use crate::error::CrawlError;
use crate::fetch::Fetcher;
use crate::platform::Platform;
use crate::proxy::ProxyPool;
use crate::session::{SecretProvider, Session, SessionStore};
use crate::transport::TransportClient;

/// Signals crawl shutdown when flipped to `true`.
pub type ShutdownHandle = watch::Sender<bool>;

/// Everything a crawl run needs, bundled.
pub struct CrawlContext {
    config: CrawlerConfig,
    transport: Arc<TransportClient>,
    proxies: Arc<ProxyPool>,
    secrets: Arc<dyn SecretProvider>,
    sessions: Arc<dyn SessionStore>,
    sink: Arc<dyn RecordSink>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for CrawlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CrawlContext {
    /// Builds a context from config and the three injected capabilities.
    /// Returns the context plus the handle that requests shutdown.
    #[must_use]
    pub fn new(
        config: CrawlerConfig,
        secrets: Arc<dyn SecretProvider>,
        sessions: Arc<dyn SessionStore>,
        sink: Arc<dyn RecordSink>,
    ) -> (Self, ShutdownHandle) {
        let (tx, rx) = watch::channel(false);
        let transport = Arc::new(TransportClient::new(config.request_timeout()));
        let proxies = Arc::new(config.proxy_pool());
        (
            Self {
                config,
                transport,
                proxies,
                secrets,
                sessions,
                sink,
                shutdown: rx,
            },
            tx,
        )
    }

    /// Replaces the transport, keeping everything else. Lets tests and
    /// captive deployments point the pipeline at a stand-in server.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<TransportClient>) -> Self {
        self.transport = transport;
        self
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// The shared proxy pool.
    #[must_use]
    pub fn proxies(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    /// The storage collaborator.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    /// A fresh receiver on the shutdown channel.
    #[must_use]
    pub fn shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Builds a fetcher for `platform`, hydrating its session from the
    /// session store and the secret provider.
    ///
    /// A missing stored session is not an error: some platforms serve
    /// anonymous reads, and signing will surface `AuthInvalid` where auth
    /// is actually required.
    ///
    /// # Errors
    ///
    /// When the session store itself is unreachable.
    pub async fn fetcher(
        &self,
        platform: Platform,
        account_id: Option<&str>,
    ) -> Result<Fetcher, CrawlError> {
        let stored = self
            .sessions
            .stored_cookies(platform, account_id)
            .await
            .map_err(crate::error::SigningError::from)?;
        let mut session = match stored {
            Some(cookies) => Session::from_cookie_str(&cookies),
            None => Session::new(),
        };
        match self.secrets.session_secrets(platform).await {
            Ok(secrets) => session.replace_secrets(secrets),
            // Platforms without in-page secrets (kuaishou) work from the
            // cookie jar alone.
            Err(err) => debug!(%platform, "no signing secrets available: {err}"),
        }
        Ok(Fetcher::new(
            platform,
            session,
            Arc::clone(&self.transport),
            Arc::clone(&self.proxies),
            Arc::clone(&self.secrets),
            self.config.retry_policy(),
            self.config.pacing(),
        ))
    }

    /// Runs one health-check pass over benched proxies, when a probe URL
    /// is configured.
    pub async fn check_proxies(&self) {
        if let Some(url) = &self.config.proxy.health_check_url {
            self.proxies
                .run_health_checks(url, self.config.request_timeout())
                .await;
        }
    }
}
