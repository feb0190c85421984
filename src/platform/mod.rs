//! Platform adapters: signing, endpoint construction and envelope parsing.
//!
//! Each supported platform gets one adapter implementing [`PlatformAdapter`]:
//! a deterministic signing transform over the session state, builders for
//! the platform's private API endpoints, and the error-code table that maps
//! its JSON envelopes into the shared [`ErrorKind`] taxonomy.
//!
//! # Architecture
//!
//! - [`Platform`] - closed tag enum; the only way to name a platform
//! - [`PlatformAdapter`] - trait every adapter implements
//! - [`RequestSpec`] - an unsigned logical request (method/path/query/body)
//! - [`Resource`] - which logical endpoint a request targets, so envelope
//!   parsing can pick the right item/cursor field names
//! - [`XhsAdapter`], [`DouyinAdapter`], [`KuaishouAdapter`],
//!   [`BilibiliAdapter`] - the fixed adapter set
//!
//! Adapters are stateless and registered statically; per-call state lives
//! in the [`Session`] the caller owns. This is a closed set by design:
//! adding a platform means adding a variant, not loading a plugin.

mod bilibili;
mod douyin;
mod kuaishou;
mod xhs;

pub use bilibili::BilibiliAdapter;
pub use douyin::DouyinAdapter;
pub use kuaishou::KuaishouAdapter;
pub use xhs::XhsAdapter;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CrawlError, SigningError};
use crate::session::{SecretProvider, Session};
use crate::transport::{Envelope, RawResponse, SignedRequest};

/// Closed set of supported platforms.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Xiaohongshu (xhs) note platform.
    Xhs,
    /// Douyin short-video platform.
    Douyin,
    /// Kuaishou short-video platform (GraphQL API).
    Kuaishou,
    /// Bilibili video platform (WBI-signed API).
    Bilibili,
}

impl Platform {
    /// All supported platforms, in registry order.
    pub const ALL: [Platform; 4] = [
        Platform::Xhs,
        Platform::Douyin,
        Platform::Kuaishou,
        Platform::Bilibili,
    ];

    /// Stable lowercase name used in config, logs and CLI arguments.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xhs => "xhs",
            Self::Douyin => "douyin",
            Self::Kuaishou => "kuaishou",
            Self::Bilibili => "bilibili",
        }
    }

    /// Returns the adapter for this platform from the static registry.
    #[must_use]
    pub fn adapter(self) -> &'static dyn PlatformAdapter {
        static XHS: LazyLock<XhsAdapter> = LazyLock::new(XhsAdapter::new);
        static DOUYIN: LazyLock<DouyinAdapter> = LazyLock::new(DouyinAdapter::new);
        static KUAISHOU: LazyLock<KuaishouAdapter> = LazyLock::new(KuaishouAdapter::new);
        static BILIBILI: LazyLock<BilibiliAdapter> = LazyLock::new(BilibiliAdapter::new);
        match self {
            Self::Xhs => &*XHS,
            Self::Douyin => &*DOUYIN,
            Self::Kuaishou => &*KUAISHOU,
            Self::Bilibili => &*BILIBILI,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xhs" | "xiaohongshu" => Ok(Self::Xhs),
            "douyin" | "dy" => Ok(Self::Douyin),
            "kuaishou" | "ks" => Ok(Self::Kuaishou),
            "bilibili" | "bili" => Ok(Self::Bilibili),
            other => Err(format!(
                "unknown platform '{other}' (expected one of: xhs, douyin, kuaishou, bilibili)"
            )),
        }
    }
}

/// Logical endpoint class a request targets.
///
/// Envelope field names (items key, cursor key, has-more key) differ per
/// platform AND per endpoint; the resource tag lets one adapter method
/// pick the right table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Keyword search over posts/videos.
    SearchPosts,
    /// One post/video detail document.
    PostDetail,
    /// First-level comments for one post.
    Comments,
    /// Second-level comments under one root comment.
    SubComments,
    /// Posts listed from a creator profile.
    CreatorPosts,
    /// A creator profile document.
    CreatorInfo,
    /// Cheap liveness probe verifying the session still authenticates.
    Ping,
}

/// HTTP method of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET with query parameters.
    Get,
    /// POST with a JSON body.
    Post,
}

/// An unsigned logical request.
///
/// Built by adapter endpoint methods, consumed by [`PlatformAdapter::sign`].
/// Query order is preserved: several signing schemes hash the exact
/// serialized query string.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Which logical endpoint this request targets.
    pub resource: Resource,
    /// HTTP method.
    pub method: Method,
    /// URI path, starting with `/`.
    pub path: String,
    /// Ordered query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body for POST requests.
    pub body: Option<Value>,
}

impl RequestSpec {
    /// Creates a GET spec.
    #[must_use]
    pub fn get(resource: Resource, path: impl Into<String>) -> Self {
        Self {
            resource,
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Creates a POST spec with a JSON body.
    #[must_use]
    pub fn post(resource: Resource, path: impl Into<String>, body: Value) -> Self {
        Self {
            resource,
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Appends a query parameter, preserving insertion order.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// A reference to one crawlable item, with the per-platform extras some
/// endpoints require (e.g. the XHS `xsec_token` returned by search).
#[derive(Debug, Clone, Default)]
pub struct ItemRef {
    /// Platform-native item id.
    pub id: String,
    /// Extra opaque values keyed by platform-specific names.
    pub extra: BTreeMap<String, String>,
}

impl ItemRef {
    /// Creates a reference with no extras.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Attaches an extra opaque value.
    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Looks up an extra value by name, defaulting to the empty string -
    /// platforms treat absent tokens as empty.
    #[must_use]
    pub fn extra(&self, name: &str) -> &str {
        self.extra.get(name).map_or("", String::as_str)
    }
}

/// Trait every platform adapter implements.
///
/// Adapters are pure with one documented exception: platforms whose
/// signing scheme rotates a key (bilibili WBI) may cache the refreshed
/// key back into the session during `sign`.
///
/// # Object Safety
///
/// `async_trait` is required: signing awaits the browser-automation
/// collaborator, and the registry hands out `&'static dyn PlatformAdapter`.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// The platform this adapter serves.
    fn platform(&self) -> Platform;

    /// Scheme+host all signed requests for this platform target.
    fn api_host(&self) -> &'static str;

    /// Computes the platform signature and produces an immutable
    /// [`SignedRequest`].
    ///
    /// Signing the same logical request twice under the same session state
    /// must yield independently accepted signatures.
    ///
    /// # Errors
    ///
    /// [`SigningError`] when required secret material is absent or stale;
    /// the caller must refresh secrets before trying again.
    async fn sign(
        &self,
        session: &mut Session,
        spec: RequestSpec,
        secrets: &dyn SecretProvider,
    ) -> Result<SignedRequest, SigningError>;

    /// Parses a raw response into a success envelope or a classified error
    /// using this platform's code table.
    ///
    /// `current_cursor` is the cursor the request was issued with; page-
    /// numbered endpoints derive the next cursor from it.
    ///
    /// # Errors
    ///
    /// A classified [`CrawlError`] for error envelopes, undecodable bodies
    /// and block signals.
    fn parse_envelope(
        &self,
        resource: Resource,
        raw: &RawResponse,
        current_cursor: Option<&str>,
    ) -> Result<Envelope, CrawlError>;

    /// Builds a keyword-search request. `cursor` is `None` for the first
    /// page.
    fn search_request(&self, keyword: &str, cursor: Option<&str>) -> RequestSpec;

    /// Builds a post/video detail request.
    fn detail_request(&self, item: &ItemRef) -> RequestSpec;

    /// Builds a first-level comment page request.
    fn comments_request(&self, item: &ItemRef, cursor: Option<&str>) -> RequestSpec;

    /// Builds a second-level comment page request under `root`.
    fn sub_comments_request(
        &self,
        item: &ItemRef,
        root: &Value,
        cursor: Option<&str>,
    ) -> RequestSpec;

    /// True when a root comment advertises sub-comments worth fetching.
    fn root_has_sub_comments(&self, root: &Value) -> bool;

    /// Builds a creator post-listing request.
    fn creator_posts_request(&self, creator_id: &str, cursor: Option<&str>) -> RequestSpec;

    /// Builds a creator profile request.
    fn creator_info_request(&self, creator_id: &str) -> RequestSpec;

    /// Builds the cheap session-liveness probe for this platform.
    fn ping_request(&self) -> RequestSpec;

    /// Extracts item references (id + required extras) from raw items of
    /// the given resource, for follow-up detail/comment fetches.
    fn item_refs(&self, resource: Resource, items: &[Value]) -> Vec<ItemRef>;
}

/// Serializes query pairs in their existing order, percent-encoding both
/// names and values the way `urllib.parse.urlencode` does.
#[must_use]
pub(crate) fn encode_query(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (name, value) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&urlencoding::encode(name));
        out.push('=');
        out.push_str(&urlencoding::encode(value));
    }
    out
}

/// Serializes a JSON body the compact way the platforms expect:
/// no spaces after separators, UTF-8 kept unescaped.
#[must_use]
pub(crate) fn compact_json(value: &Value) -> String {
    // serde_json's default to_string already matches
    // json.dumps(separators=(",", ":"), ensure_ascii=False)
    value.to_string()
}
