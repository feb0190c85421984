//! Crawl orchestration core for consumer social platforms.
//!
//! This library drives listing, detail and comment collection against the
//! web APIs of Xiaohongshu, Douyin, Kuaishou and Bilibili. The platforms
//! are hostile: requests must carry browser-derived signatures, responses
//! hide their verdicts inside per-platform envelope codes, and sustained
//! traffic gets IP-blocked. The crate treats those constraints as the
//! domain itself.
//!
//! # Architecture
//!
//! - [`platform`] - per-platform adapters: request construction, signing
//!   and envelope classification
//! - [`session`] - browser-session secrets and signature evaluation
//! - [`transport`] - signed-request execution over optionally proxied
//!   connections
//! - [`fetch`] - per-platform fetcher: sign, send, classify, paginate
//! - [`retry`] - error-kind-aware backoff policy
//! - [`proxy`] - rotating proxy pool with health scoring
//! - [`batch`] - bounded-concurrency task groups with deadlines
//! - [`crawl`] - the crawl entry point and record sink seam
//!
//! Browser automation, login flows and storage backends stay outside the
//! crate; they plug in through the [`session::SecretProvider`],
//! [`session::SessionStore`] and [`crawl::RecordSink`] traits.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod config;
pub mod context;
pub mod crawl;
pub mod error;
pub mod fetch;
pub mod platform;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod transport;
pub mod user_agent;

// Re-export commonly used types
pub use batch::{BatchConfig, BatchReport, BatchScheduler};
pub use config::{ConfigError, CrawlerConfig};
pub use context::{CrawlContext, ShutdownHandle};
pub use crawl::{
    CrawlMode, CrawlRequest, CrawlSummary, MemorySink, RecordKind, RecordSink, run_crawl,
};
pub use error::{CrawlError, ErrorKind, RetryHint, SigningError};
pub use fetch::{Fetcher, Pacing};
pub use platform::{ItemRef, Method, Platform, PlatformAdapter, RequestSpec, Resource};
pub use proxy::{AnonymityLevel, ProxyEndpoint, ProxyPool, ProxyProtocol, Strategy};
pub use retry::RetryPolicy;
pub use session::{
    BrowserSignature, SecretProvider, Session, SessionError, SessionSecrets, SessionStore,
    StaticSecretProvider, StaticSessionStore,
};
pub use transport::{Envelope, RawResponse, SignedRequest, TransportClient};
