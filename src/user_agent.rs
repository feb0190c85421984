//! Shared User-Agent policy for platform API traffic.
//!
//! All platform clients present one browser User-Agent so traffic is not
//! trivially fingerprintable per adapter. The string must stay consistent
//! with the device/browser parameters the douyin adapter reports in its
//! common query table, or the platform rejects the mismatch.

/// Browser identity presented to every platform.
///
/// Chrome on macOS, matching the engine/OS values in
/// [`crate::platform::douyin`]'s common parameter table.
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";
