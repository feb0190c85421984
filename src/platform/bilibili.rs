//! Bilibili adapter.
//!
//! Bilibili signs query strings with the WBI scheme: two rotating keys
//! (`img_key`, `sub_key`) published via the nav endpoint are concatenated,
//! shuffled through a fixed index table and truncated to a 32-char mixin
//! key; the request params are sorted, scrubbed of a few punctuation
//! chars, stamped with `wts` and hashed with md5 into `w_rid`. The keys
//! come from the browser collaborator and are cached into the session,
//! the one documented case of signing mutating session state.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use md5::{Digest, Md5};
use serde_json::Value;

use crate::error::{CrawlError, ErrorKind, SigningError};
use crate::platform::{ItemRef, Platform, PlatformAdapter, RequestSpec, Resource, encode_query};
use crate::session::{SecretProvider, Session};
use crate::transport::{Envelope, RawResponse, SignedRequest};
use crate::user_agent::BROWSER_USER_AGENT;

const API_HOST: &str = "https://api.bilibili.com";
const WEB_ORIGIN: &str = "https://www.bilibili.com";

/// Session secret name holding the `img_url-sub_url` pair the web player
/// stores in localStorage.
const WBI_URLS_KEY: &str = "wbi_img_urls";

/// Index shuffle applied to `img_key + sub_key` to derive the mixin key.
const MIXIN_KEY_TABLE: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22,
    25, 54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

/// Characters stripped from parameter values before signing.
const SCRUBBED_CHARS: [char; 5] = ['!', '\'', '(', ')', '*'];

/// Envelope code for success.
const CODE_OK: i64 = 0;
/// Envelope code for a blocked address.
const CODE_IP_BLOCKED: i64 = -403;
/// Envelope code the risk system uses for rejected requests; paired with a
/// rate-limit message it means back off, otherwise the session is flagged.
const CODE_RISK_REJECTED: i64 = -412;
/// Envelope code for missing content.
const CODE_NOT_FOUND: i64 = -404;

fn mixin_key(img_key: &str, sub_key: &str) -> String {
    let combined: Vec<char> = format!("{img_key}{sub_key}").chars().collect();
    MIXIN_KEY_TABLE
        .iter()
        .filter_map(|&index| combined.get(index))
        .take(32)
        .collect()
}

/// Extracts the key from a wbi image URL: the final path segment without
/// its extension.
fn key_from_url(url: &str) -> &str {
    let tail = url.rsplit('/').next().unwrap_or(url);
    tail.split('.').next().unwrap_or(tail)
}

fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    digest.iter().fold(String::with_capacity(32), |mut out, b| {
        out.push_str(&format!("{b:02x}"));
        out
    })
}

/// Applies the WBI transform to `params`, returning the final ordered
/// query including `wts` and `w_rid`.
fn wbi_sign(params: &[(String, String)], mixin: &str, wts: u64) -> Vec<(String, String)> {
    let mut sorted: Vec<(String, String)> = params
        .iter()
        .map(|(name, value)| {
            let scrubbed: String = value.chars().filter(|c| !SCRUBBED_CHARS.contains(c)).collect();
            (name.clone(), scrubbed)
        })
        .collect();
    sorted.push(("wts".to_string(), wts.to_string()));
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical = encode_query(&sorted);
    let w_rid = md5_hex(&format!("{canonical}{mixin}"));
    sorted.push(("w_rid".to_string(), w_rid));
    sorted
}

/// Adapter for the Bilibili web API.
#[derive(Debug, Default)]
pub struct BilibiliAdapter;

impl BilibiliAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformAdapter for BilibiliAdapter {
    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn api_host(&self) -> &'static str {
        API_HOST
    }

    async fn sign(
        &self,
        session: &mut Session,
        spec: RequestSpec,
        secrets: &dyn SecretProvider,
    ) -> Result<SignedRequest, SigningError> {
        // Pull the rotating key pair from the session cache, refreshing it
        // from the collaborator on first use.
        let urls = match session.local_storage(WBI_URLS_KEY) {
            Some(cached) => cached.to_string(),
            None => {
                let fresh = secrets.session_secrets(Platform::Bilibili).await?;
                session.replace_secrets(fresh);
                session
                    .local_storage(WBI_URLS_KEY)
                    .ok_or_else(|| SigningError::missing(Platform::Bilibili, WBI_URLS_KEY))?
                    .to_string()
            }
        };
        let (img_url, sub_url) = urls
            .split_once('-')
            .ok_or_else(|| SigningError::stale(Platform::Bilibili, WBI_URLS_KEY))?;
        let mixin = mixin_key(key_from_url(img_url), key_from_url(sub_url));

        let wts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let signed_query = wbi_sign(&spec.query, &mixin, wts);

        let mut headers = vec![
            ("user-agent".to_string(), BROWSER_USER_AGENT.to_string()),
            ("origin".to_string(), WEB_ORIGIN.to_string()),
            ("referer".to_string(), format!("{WEB_ORIGIN}/")),
        ];
        if !session.is_anonymous() {
            headers.push(("cookie".to_string(), session.cookie_header()));
        }
        headers.extend(session.extra_headers().iter().cloned());

        Ok(SignedRequest {
            platform: Platform::Bilibili,
            resource: spec.resource,
            method: spec.method,
            url: format!("{API_HOST}{}?{}", spec.path, encode_query(&signed_query)),
            headers,
            body: None,
        })
    }

    fn parse_envelope(
        &self,
        resource: Resource,
        raw: &RawResponse,
        current_cursor: Option<&str>,
    ) -> Result<Envelope, CrawlError> {
        let envelope = raw.json()?;
        let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != CODE_OK {
            let message = envelope
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string();
            let kind = match code {
                CODE_IP_BLOCKED => ErrorKind::IpBlocked,
                CODE_NOT_FOUND => ErrorKind::NotFound,
                CODE_RISK_REJECTED if message.contains("请求过于频繁") => {
                    ErrorKind::FrequencyLimited
                }
                CODE_RISK_REJECTED => ErrorKind::IpBlocked,
                _ => ErrorKind::Unclassified,
            };
            return Err(
                CrawlError::platform(Platform::Bilibili, kind, code, message)
                    .with_retry_after(raw.retry_after()),
            );
        }

        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        let page: u64 = current_cursor.and_then(|c| c.parse().ok()).unwrap_or(1);
        match resource {
            Resource::PostDetail | Resource::CreatorInfo | Resource::Ping => {
                Ok(Envelope::document(data))
            }
            Resource::SearchPosts => {
                let items = data
                    .get("result")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let num_pages = data.get("numPages").and_then(Value::as_u64).unwrap_or(0);
                Ok(Envelope::page(
                    data,
                    items,
                    Some((page + 1).to_string()),
                    page < num_pages,
                ))
            }
            Resource::Comments => {
                let items = data
                    .get("replies")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let cursor = data.get("cursor").cloned().unwrap_or(Value::Null);
                let is_end = cursor.get("is_end").and_then(Value::as_bool).unwrap_or(true);
                let next = cursor
                    .get("next")
                    .and_then(Value::as_u64)
                    .map(|n| n.to_string());
                Ok(Envelope::page(data, items, next, !is_end))
            }
            Resource::SubComments => {
                let items = data
                    .get("replies")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let (num, size, count) = page_counts(&data);
                Ok(Envelope::page(
                    data,
                    items,
                    Some((num + 1).to_string()),
                    num * size < count,
                ))
            }
            Resource::CreatorPosts => {
                let items = data
                    .get("list")
                    .and_then(|l| l.get("vlist"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let (num, size, count) = page_counts(&data);
                Ok(Envelope::page(
                    data,
                    items,
                    Some((num + 1).to_string()),
                    num * size < count,
                ))
            }
        }
    }

    fn search_request(&self, keyword: &str, cursor: Option<&str>) -> RequestSpec {
        let page = cursor.unwrap_or("1");
        RequestSpec::get(Resource::SearchPosts, "/x/web-interface/wbi/search/type")
            .with_param("search_type", "video")
            .with_param("keyword", keyword)
            .with_param("page", page)
            .with_param("page_size", "20")
            .with_param("order", "totalrank")
    }

    fn detail_request(&self, item: &ItemRef) -> RequestSpec {
        RequestSpec::get(Resource::PostDetail, "/x/web-interface/view/detail")
            .with_param("bvid", &item.id)
    }

    fn comments_request(&self, item: &ItemRef, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::Comments, "/x/v2/reply/wbi/main")
            .with_param("oid", item.extra("aid"))
            .with_param("type", "1")
            .with_param("mode", "3")
            .with_param("next", cursor.unwrap_or("0"))
    }

    fn sub_comments_request(
        &self,
        item: &ItemRef,
        root: &Value,
        cursor: Option<&str>,
    ) -> RequestSpec {
        let root_id = root
            .get("rpid")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        RequestSpec::get(Resource::SubComments, "/x/v2/reply/reply")
            .with_param("oid", item.extra("aid"))
            .with_param("type", "1")
            .with_param("root", root_id)
            .with_param("pn", cursor.unwrap_or("1"))
            .with_param("ps", "20")
    }

    fn root_has_sub_comments(&self, root: &Value) -> bool {
        root.get("rcount").and_then(Value::as_u64).unwrap_or(0) > 0
    }

    fn creator_posts_request(&self, creator_id: &str, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::CreatorPosts, "/x/space/wbi/arc/search")
            .with_param("mid", creator_id)
            .with_param("pn", cursor.unwrap_or("1"))
            .with_param("ps", "30")
            .with_param("order", "pubdate")
    }

    fn creator_info_request(&self, creator_id: &str) -> RequestSpec {
        RequestSpec::get(Resource::CreatorInfo, "/x/space/wbi/acc/info")
            .with_param("mid", creator_id)
    }

    fn ping_request(&self) -> RequestSpec {
        RequestSpec::get(Resource::Ping, "/x/web-interface/nav")
    }

    fn item_refs(&self, _resource: Resource, items: &[Value]) -> Vec<ItemRef> {
        // Every listing shape here carries bvid and aid side by side; the
        // comment endpoints need the numeric aid as their oid.
        items
            .iter()
            .filter_map(|item| {
                let bvid = item.get("bvid").and_then(Value::as_str)?;
                let aid = item.get("aid").map_or_else(String::new, |v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                Some(ItemRef::new(bvid).with_extra("aid", aid))
            })
            .collect()
    }
}

/// Reads the `page {num, size, count}` pagination block, defaulting to an
/// exhausted single page.
fn page_counts(data: &Value) -> (u64, u64, u64) {
    let page = data.get("page").cloned().unwrap_or(Value::Null);
    let num = page.get("num").and_then(Value::as_u64).unwrap_or(1);
    let size = page.get("size").and_then(Value::as_u64).unwrap_or(0);
    let count = page.get("count").and_then(Value::as_u64).unwrap_or(0);
    (num, size, count)
}
