//! HTTP transport: executes signed requests and returns raw responses.
//!
//! The transport is a pure request/response mapper. It never retries,
//! never re-signs and never sleeps; those policies belong to the fetcher
//! and the retry module. Its one responsibility is turning a
//! [`SignedRequest`] into a [`RawResponse`] over an optionally proxied
//! connection, mapping connection-level failures into
//! [`ErrorKind::TransientNetwork`](crate::error::ErrorKind::TransientNetwork).
//!
//! reqwest binds a proxy to a `Client`, not to a request, so the transport
//! keeps one lazily built client per proxy endpoint in a [`DashMap`].

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::CrawlError;
use crate::platform::{Method, Platform, Resource};
use crate::proxy::ProxyEndpoint;
use crate::user_agent::BROWSER_USER_AGENT;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-cache key for the direct (unproxied) connection.
const DIRECT_CLIENT_KEY: u64 = 0;

/// A fully signed, immutable HTTP request.
///
/// Produced by a platform adapter; nothing downstream may alter it.
/// Retrying means asking the adapter to sign again, never replaying or
/// editing a stale signature.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Platform that signed this request.
    pub platform: Platform,
    /// Logical endpoint class, threaded through for envelope parsing.
    pub resource: Resource,
    /// HTTP method.
    pub method: Method,
    /// Absolute URL including the serialized query string.
    pub url: String,
    /// Headers in send order, signature headers included.
    pub headers: Vec<(String, String)>,
    /// Serialized JSON body for POST requests. Signing schemes hash the
    /// exact bytes, so the body is fixed as a string at signing time.
    pub body: Option<String>,
}

impl SignedRequest {
    /// Looks up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A raw platform response: status, headers and undecoded body.
///
/// Classification happens in the adapter's envelope parser; the transport
/// only surfaces what arrived.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers with lowercased names.
    pub headers: Vec<(String, String)>,
    /// Body text as received.
    pub body: String,
    /// The URL the request was sent to, kept for error reporting.
    pub url: String,
}

impl RawResponse {
    /// Looks up a response header by lowercase name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parses a `Retry-After` header, accepting both delta-seconds and
    /// HTTP-date forms.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let value = self.header("retry-after")?;
        if let Ok(secs) = value.trim().parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        let when = httpdate::parse_http_date(value).ok()?;
        when.duration_since(std::time::SystemTime::now()).ok()
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// [`CrawlError::Decode`] carrying the URL and a bounded body sample.
    pub fn json(&self) -> Result<Value, CrawlError> {
        serde_json::from_str(&self.body)
            .map_err(|err| CrawlError::decode(&self.url, format!("{err}; body: {}", self.body)))
    }
}

/// A parsed success envelope.
///
/// `next_cursor` is already normalized: when the platform says there is no
/// further page, it is `None` regardless of what cursor value the envelope
/// carried.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The platform's `data` payload.
    pub data: Value,
    /// List items for paginated resources, empty for detail documents.
    pub items: Vec<Value>,
    /// Cursor for the next page, `None` when pagination is exhausted.
    pub next_cursor: Option<String>,
}

impl Envelope {
    /// An envelope for a single-document resource.
    #[must_use]
    pub fn document(data: Value) -> Self {
        Self {
            data,
            items: Vec::new(),
            next_cursor: None,
        }
    }

    /// An envelope for one page of a paginated resource, normalizing the
    /// cursor against the has-more flag.
    #[must_use]
    pub fn page(data: Value, items: Vec<Value>, next_cursor: Option<String>, has_more: bool) -> Self {
        Self {
            data,
            items,
            next_cursor: if has_more { next_cursor } else { None },
        }
    }
}

/// Executes signed requests, one proxied `reqwest::Client` per endpoint.
#[derive(Debug)]
pub struct TransportClient {
    clients: DashMap<u64, reqwest::Client>,
    timeout: Duration,
    host_override: Option<url::Url>,
}

impl Default for TransportClient {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl TransportClient {
    /// Creates a transport with the given per-request timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            timeout,
            host_override: None,
        }
    }

    /// Redirects every request to `base`, keeping path and query intact.
    /// Used to point the whole pipeline at a local stand-in server.
    #[must_use]
    pub fn with_host_override(mut self, base: url::Url) -> Self {
        self.host_override = Some(base);
        self
    }

    /// Applies the host override to an absolute URL, if one is set.
    fn effective_url(&self, raw: &str) -> String {
        let Some(base) = &self.host_override else {
            return raw.to_string();
        };
        match url::Url::parse(raw) {
            Ok(mut parsed) => {
                let _ = parsed.set_scheme(base.scheme());
                let _ = parsed.set_host(base.host_str());
                let _ = parsed.set_port(base.port());
                parsed.to_string()
            }
            Err(_) => raw.to_string(),
        }
    }

    /// Sends a signed request, optionally through `proxy`, and returns the
    /// raw response without interpreting its envelope.
    ///
    /// # Errors
    ///
    /// [`CrawlError::Network`] for connection, TLS, timeout and proxy
    /// failures. HTTP error statuses are NOT errors here; the adapter's
    /// code table decides what they mean.
    #[instrument(skip(self, request), fields(platform = %request.platform.as_str(), url = %request.url))]
    pub async fn execute(
        &self,
        request: &SignedRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<RawResponse, CrawlError> {
        let client = self.client_for(proxy)?;
        let url = self.effective_url(&request.url);

        let mut builder = match request.method {
            Method::Get => client.get(&url),
            Method::Post => client.post(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header("content-type", "application/json;charset=UTF-8")
                .body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| CrawlError::network(&url, err))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|err| CrawlError::network(&url, err))?;

        debug!(status, body_len = body.len(), "response received");
        Ok(RawResponse {
            status,
            headers,
            body,
            url,
        })
    }

    /// Returns the cached client for `proxy`, building it on first use.
    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<reqwest::Client, CrawlError> {
        let key = proxy.map_or(DIRECT_CLIENT_KEY, ProxyEndpoint::cache_key);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(BROWSER_USER_AGENT)
            .gzip(true);
        if let Some(endpoint) = proxy {
            let url = endpoint.url();
            let built = reqwest::Proxy::all(&url).map_err(|err| {
                warn!(proxy = %endpoint.describe(), "invalid proxy endpoint");
                CrawlError::network(&url, err)
            })?;
            builder = builder.proxy(built);
        }
        let client = builder
            .build()
            .map_err(|err| CrawlError::network("client-build", err))?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}
