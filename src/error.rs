//! Error taxonomy for the crawl orchestration core.
//!
//! This module defines the classified error kinds shared by the transport
//! client, the fetchers and the retry policy. Platform adapters map their
//! private error-code tables into [`ErrorKind`]; everything above the
//! transport layer reasons only about the classification, never about raw
//! platform codes.
//!
//! # Overview
//!
//! - [`ErrorKind`] - closed set of block/limit/auth/terminal classifications
//! - [`RetryHint`] - the wait class suggested by the classifying adapter
//! - [`CrawlError`] - the concrete error type carried through the core
//! - [`SigningError`] - failures producing a request signature
//!
//! Retry decisions are NOT made here; see [`crate::retry::RetryPolicy`].
//! Keeping classification and policy separate lets backoff tuning change
//! without touching transport code.

use std::time::Duration;

use thiserror::Error;

use crate::platform::Platform;

/// Classification of a failed platform call.
///
/// Each kind corresponds to a distinct recovery path, from "wait a long
/// time and hope the block lifts" down to "stop, nothing will help".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The platform has blocked the calling IP (e.g. XHS code 300012,
    /// bilibili -403). Long randomized wait before retrying.
    IpBlocked,

    /// Request frequency exceeded, including captcha challenges
    /// (HTTP 461/471) and bilibili -412. Medium randomized wait.
    FrequencyLimited,

    /// Session cookies or signing secrets are no longer accepted.
    /// Not retryable until a fresh session is acquired.
    AuthInvalid,

    /// The resource does not exist or has been removed (e.g. XHS
    /// -510000 "note missing"). An expected terminal state, not a fault.
    NotFound,

    /// Network-level failure: timeout, connect error, 5xx. Short
    /// exponential backoff.
    TransientNetwork,

    /// Anything the per-platform code tables do not recognize.
    /// One retry, then surface with the full diagnostic payload.
    Unclassified,
}

impl ErrorKind {
    /// The wait class an adapter suggests alongside this kind.
    #[must_use]
    pub fn default_hint(self) -> RetryHint {
        match self {
            Self::IpBlocked => RetryHint::LongWait,
            Self::FrequencyLimited => RetryHint::LongWait,
            Self::TransientNetwork | Self::Unclassified => RetryHint::ShortWait,
            Self::AuthInvalid | Self::NotFound => RetryHint::Abort,
        }
    }

    /// Stable lowercase name used in logs and crawl summaries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IpBlocked => "ip_blocked",
            Self::FrequencyLimited => "frequency_limited",
            Self::AuthInvalid => "auth_invalid",
            Self::NotFound => "not_found",
            Self::TransientNetwork => "transient_network",
            Self::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Suggested handling attached to a classification by the adapter that
/// produced it. The retry policy may override the suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Retry immediately if attempts remain.
    None,
    /// Retry after a short backoff.
    ShortWait,
    /// Retry after a long randomized wait.
    LongWait,
    /// Do not retry.
    Abort,
}

/// Errors produced while computing a request signature.
///
/// Signing errors are never retried by the caller; the owning client must
/// refresh its secrets first.
#[derive(Debug, Error)]
pub enum SigningError {
    /// A secret the transform needs is not present in the session.
    #[error("{platform} signing requires secret '{name}' which is absent")]
    MissingSecret {
        /// The platform whose adapter failed.
        platform: Platform,
        /// Name of the missing cookie/localStorage value.
        name: &'static str,
    },

    /// The secret material is present but the platform rejected it, or it
    /// has passed its refresh deadline.
    #[error("{platform} signing secret '{name}' is stale and must be refreshed")]
    StaleSecret {
        /// The platform whose adapter failed.
        platform: Platform,
        /// Name of the stale value.
        name: &'static str,
    },

    /// The browser-automation collaborator failed to evaluate the
    /// dynamic signature function.
    #[error("{platform} browser signature evaluation failed: {reason}")]
    Evaluation {
        /// The platform whose adapter failed.
        platform: Platform,
        /// Collaborator-reported reason.
        reason: String,
    },
}

impl SigningError {
    /// Creates a missing-secret error.
    pub fn missing(platform: Platform, name: &'static str) -> Self {
        Self::MissingSecret { platform, name }
    }

    /// Creates a stale-secret error.
    pub fn stale(platform: Platform, name: &'static str) -> Self {
        Self::StaleSecret { platform, name }
    }

    /// Creates an evaluation error from the browser collaborator.
    pub fn evaluation(platform: Platform, reason: impl Into<String>) -> Self {
        Self::Evaluation {
            platform,
            reason: reason.into(),
        }
    }
}

/// Errors carried through the crawl core.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Request signing failed; see [`SigningError`].
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// The platform returned an error envelope that was classified by the
    /// adapter's code table.
    #[error("{platform} returned {kind}: {message} (code {code:?})", kind = .kind.as_str())]
    Platform {
        /// The platform that produced the envelope.
        platform: Platform,
        /// Classified kind.
        kind: ErrorKind,
        /// Raw platform error code, when the envelope carried one.
        code: Option<i64>,
        /// Raw platform message, preserved for diagnostics.
        message: String,
        /// Server-suggested wait (Retry-After), when present.
        retry_after: Option<Duration>,
    },

    /// Network-level failure before any envelope could be read.
    #[error("network error calling {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body was not the JSON envelope the adapter expects.
    #[error("undecodable response from {url}: {detail}")]
    Decode {
        /// The URL whose body failed to parse.
        url: String,
        /// Parser diagnostic plus a body excerpt.
        detail: String,
    },

    /// A batch group deadline expired before this task completed.
    #[error("task aborted by batch deadline (group {group})")]
    BatchTimeout {
        /// Zero-based index of the timed-out group.
        group: usize,
    },
}

impl CrawlError {
    /// Creates a classified platform error with the kind's default hint.
    pub fn platform(
        platform: Platform,
        kind: ErrorKind,
        code: impl Into<Option<i64>>,
        message: impl Into<String>,
    ) -> Self {
        Self::Platform {
            platform,
            kind,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a server-suggested wait to a platform classification.
    /// No-op for other variants.
    #[must_use]
    pub fn with_retry_after(mut self, wait: impl Into<Option<Duration>>) -> Self {
        if let Self::Platform { retry_after, .. } = &mut self {
            *retry_after = wait.into();
        }
        self
    }

    /// Creates a network error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a decode error, keeping a bounded excerpt of the body.
    pub fn decode(url: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut detail = detail.into();
        if detail.len() > 512 {
            let cut = (0..=512)
                .rev()
                .find(|&i| detail.is_char_boundary(i))
                .unwrap_or(0);
            detail.truncate(cut);
        }
        Self::Decode {
            url: url.into(),
            detail,
        }
    }

    /// The classification the retry policy should reason about.
    ///
    /// Signing errors map to [`ErrorKind::AuthInvalid`]: both mean "no
    /// further progress until session material is refreshed". Batch
    /// timeouts map to [`ErrorKind::Unclassified`] - they are reported,
    /// not re-driven through the policy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Signing(_) => ErrorKind::AuthInvalid,
            Self::Platform { kind, .. } => *kind,
            Self::Network { .. } => ErrorKind::TransientNetwork,
            Self::Decode { .. } => ErrorKind::Unclassified,
            Self::BatchTimeout { .. } => ErrorKind::Unclassified,
        }
    }

    /// Server-suggested wait, when the platform sent one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Platform { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
