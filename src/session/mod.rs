//! Platform sessions and the capabilities that hydrate them.
//!
//! A [`Session`] is the authenticated state one platform client owns: a
//! cookie jar, extra request headers, and the opaque signing secrets some
//! platforms require (browser localStorage values, rotating keys). A
//! session is never shared across platforms; it is mutated only by
//! [`Session::update_cookies`] and [`Session::replace_secrets`], and is
//! dropped with its client.
//!
//! Two injected capabilities feed sessions. [`SessionStore`] is the
//! login/session collaborator: it yields stored cookie strings at client
//! construction. [`SecretProvider`] is the browser-automation collaborator:
//! it yields localStorage secrets and evaluates dynamic signature functions
//! the platforms only expose in-page. The core never drives a browser.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::platform::Platform;

/// Secrets fetched from the browser-automation collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSecrets {
    /// Cookies visible in the browser context (name -> value).
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// localStorage entries (e.g. xhs `b1`, douyin `xmst`,
    /// bilibili `wbi_img_urls`).
    #[serde(default)]
    pub local_storage: BTreeMap<String, String>,
}

/// Result of evaluating a platform's in-page signature function.
///
/// Key names are platform-specific (`X-s`/`X-t` for XHS, `a_bogus` for
/// douyin); the adapter knows which keys it asked for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowserSignature {
    /// Produced values by name.
    pub values: BTreeMap<String, String>,
}

impl BrowserSignature {
    /// Looks up a produced value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Failure reported by a session capability.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The collaborator is unreachable or refused the request.
    #[error("session capability unavailable for {platform}: {reason}")]
    Unavailable {
        /// The platform the request was for.
        platform: Platform,
        /// Collaborator-reported reason.
        reason: String,
    },
}

impl SessionError {
    /// Creates an unavailable-capability error.
    pub fn unavailable(platform: Platform, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            platform,
            reason: reason.into(),
        }
    }
}

impl From<SessionError> for crate::error::SigningError {
    fn from(err: SessionError) -> Self {
        let SessionError::Unavailable { platform, reason } = err;
        Self::evaluation(platform, reason)
    }
}

/// Browser-automation collaborator capability.
///
/// Invoked by signing adapters when secrets are absent or stale, and for
/// the platforms whose signature function only exists in-page.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Fetches the current cookies and localStorage values for a platform.
    async fn session_secrets(&self, platform: Platform)
    -> Result<SessionSecrets, SessionError>;

    /// Evaluates the platform's in-page signature function over the given
    /// path-with-query and optional JSON body.
    async fn evaluate_signature(
        &self,
        platform: Platform,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<BrowserSignature, SessionError>;
}

/// Login/session collaborator capability.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the stored cookie string for a platform (and optionally a
    /// specific account), or `None` when no session exists.
    async fn stored_cookies(
        &self,
        platform: Platform,
        account_id: Option<&str>,
    ) -> Result<Option<String>, SessionError>;
}

/// Authenticated state owned by exactly one platform client.
#[derive(Debug, Clone, Default)]
pub struct Session {
    cookies: BTreeMap<String, String>,
    extra_headers: Vec<(String, String)>,
    secrets: SessionSecrets,
}

impl Session {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session hydrated from a stored cookie string.
    #[must_use]
    pub fn from_cookie_str(cookie_str: &str) -> Self {
        Self {
            cookies: parse_cookie_str(cookie_str),
            extra_headers: Vec::new(),
            secrets: SessionSecrets::default(),
        }
    }

    /// Replaces the cookie jar from a `name=value; ...` string.
    ///
    /// Later duplicates win, matching browser serialization order.
    pub fn update_cookies(&mut self, cookie_str: &str) {
        self.cookies = parse_cookie_str(cookie_str);
    }

    /// Merges cookies delivered by the secret provider without dropping
    /// existing entries.
    pub fn merge_cookies(&mut self, cookies: &BTreeMap<String, String>) {
        for (name, value) in cookies {
            self.cookies.insert(name.clone(), value.clone());
        }
    }

    /// Looks up a cookie by name.
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Serializes the jar back to a `Cookie:` header value.
    #[must_use]
    pub fn cookie_header(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.cookies {
            if !out.is_empty() {
                out.push_str("; ");
            }
            out.push_str(name);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    /// True when the jar holds no cookies at all.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Adds a header sent with every request signed under this session.
    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extra_headers.push((name.into(), value.into()));
    }

    /// Headers sent with every request under this session.
    #[must_use]
    pub fn extra_headers(&self) -> &[(String, String)] {
        &self.extra_headers
    }

    /// Looks up a localStorage secret by name.
    #[must_use]
    pub fn local_storage(&self, name: &str) -> Option<&str> {
        self.secrets.local_storage.get(name).map(String::as_str)
    }

    /// Replaces the signing secrets wholesale (secret refresh path) and
    /// merges any cookies the provider returned alongside them.
    pub fn replace_secrets(&mut self, secrets: SessionSecrets) {
        self.merge_cookies(&secrets.cookies);
        self.secrets = secrets;
    }

    /// Stores a single rotating secret (bilibili WBI keys). This is the
    /// documented exception allowing signing to mutate session state.
    pub fn store_secret(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.local_storage.insert(name.into(), value.into());
    }
}

/// Parses a `name=value; name2=value2` cookie string into a map.
///
/// Malformed fragments (no `=`) are skipped rather than failing the whole
/// string - stored sessions frequently carry trailing garbage.
#[must_use]
pub fn parse_cookie_str(cookie_str: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for fragment in cookie_str.split(';') {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }
        if let Some((name, value)) = fragment.split_once('=') {
            let name = name.trim();
            if !name.is_empty() {
                map.insert(name.to_string(), value.trim().to_string());
            }
        }
    }
    map
}

/// In-memory [`SecretProvider`] backed by fixed values.
///
/// Used by the CLI (secrets exported from a browser profile to a JSON
/// file) and by tests. `evaluate_signature` returns the configured values
/// unchanged, so tests can assert the adapter's deterministic parts.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    secrets: SessionSecrets,
    signature: BrowserSignature,
}

impl StaticSecretProvider {
    /// Creates a provider serving the given secrets and signature values.
    #[must_use]
    pub fn new(secrets: SessionSecrets, signature: BrowserSignature) -> Self {
        Self { secrets, signature }
    }

    /// Loads a provider from the JSON shape `{cookies, local_storage,
    /// signature_values}`.
    ///
    /// # Errors
    ///
    /// Returns the underlying JSON error on malformed input.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            cookies: BTreeMap<String, String>,
            #[serde(default)]
            local_storage: BTreeMap<String, String>,
            #[serde(default)]
            signature_values: BTreeMap<String, String>,
        }
        let raw: Raw = serde_json::from_str(raw)?;
        Ok(Self {
            secrets: SessionSecrets {
                cookies: raw.cookies,
                local_storage: raw.local_storage,
            },
            signature: BrowserSignature {
                values: raw.signature_values,
            },
        })
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn session_secrets(
        &self,
        _platform: Platform,
    ) -> Result<SessionSecrets, SessionError> {
        Ok(self.secrets.clone())
    }

    async fn evaluate_signature(
        &self,
        _platform: Platform,
        _path_and_query: &str,
        _body: Option<&serde_json::Value>,
    ) -> Result<BrowserSignature, SessionError> {
        Ok(self.signature.clone())
    }
}

/// [`SessionStore`] serving one fixed cookie string per platform.
#[derive(Debug, Clone, Default)]
pub struct StaticSessionStore {
    cookies: BTreeMap<Platform, String>,
}

impl StaticSessionStore {
    /// Creates an empty store (all platforms anonymous).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stored cookie string for a platform.
    #[must_use]
    pub fn with_cookies(mut self, platform: Platform, cookie_str: impl Into<String>) -> Self {
        self.cookies.insert(platform, cookie_str.into());
        self
    }
}

#[async_trait]
impl SessionStore for StaticSessionStore {
    async fn stored_cookies(
        &self,
        platform: Platform,
        _account_id: Option<&str>,
    ) -> Result<Option<String>, SessionError> {
        Ok(self.cookies.get(&platform).cloned())
    }
}
