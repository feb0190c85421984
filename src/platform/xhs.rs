//! Xiaohongshu adapter.
//!
//! XHS signs requests with two cooperating pieces: the `X-s`/`X-t` pair the
//! in-page signer computes over path and body, and the `x-s-common` header
//! this adapter derives locally from session material (`a1` cookie, `b1`
//! local-storage value) plus a custom-alphabet base64 of a fixed JSON
//! payload. A per-request `x-b3-traceid` of 16 random hex chars rounds out
//! the header set.

use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};

use crate::error::{CrawlError, ErrorKind, SigningError};
use crate::platform::{
    ItemRef, Platform, PlatformAdapter, RequestSpec, Resource, compact_json, encode_query,
};
use crate::session::{SecretProvider, Session};
use crate::transport::{Envelope, RawResponse, SignedRequest};
use crate::user_agent::BROWSER_USER_AGENT;

const API_HOST: &str = "https://edith.xiaohongshu.com";
const WEB_ORIGIN: &str = "https://www.xiaohongshu.com";

/// Alphabet for the non-standard base64 variant `x-s-common` uses.
const B64_ALPHABET: &[u8; 64] =
    b"ZmserbBoHQtNP+wOcza/LpngG8yJq42KWYj0DSfdikx3VT16IlUAFM97hECvuRX5";

/// Envelope code signalling an IP block.
const CODE_IP_BLOCKED: i64 = 300_012;
/// Envelope codes for removed or never-existing content.
const CODES_NOT_FOUND: [i64; 2] = [-510_000, -510_001];
/// HTTP statuses that carry a captcha challenge instead of an envelope.
const CAPTCHA_STATUSES: [u16; 2] = [461, 471];

static CRC_TABLE: LazyLock<[u32; 256]> = LazyLock::new(|| {
    let mut table = [0u32; 256];
    for (index, entry) in table.iter_mut().enumerate() {
        let mut value = index as u32;
        for _ in 0..8 {
            value = if value & 1 == 1 {
                0xEDB8_8320 ^ (value >> 1)
            } else {
                value >> 1
            };
        }
        *entry = value;
    }
    table
});

/// Checksum the platform embeds as `x9` in the common payload. A reflected
/// CRC-32 with an extra final xor, truncated to a signed 32-bit value.
fn mrc(input: &str) -> i64 {
    let mut acc: u32 = 0xFFFF_FFFF;
    for byte in input.bytes() {
        let index = ((acc ^ u32::from(byte)) & 0xFF) as usize;
        acc = CRC_TABLE[index] ^ (acc >> 8);
    }
    i64::from((acc ^ 0xFFFF_FFFF ^ 0xEDB8_8320) as i32)
}

/// Base64 over [`B64_ALPHABET`] with `=` padding.
fn custom_b64(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b0 = u32::from(chunk[0]);
        let b1 = chunk.get(1).copied().map_or(0, u32::from);
        let b2 = chunk.get(2).copied().map_or(0, u32::from);
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(B64_ALPHABET[(triple >> 18) as usize & 63] as char);
        out.push(B64_ALPHABET[(triple >> 12) as usize & 63] as char);
        if chunk.len() > 1 {
            out.push(B64_ALPHABET[(triple >> 6) as usize & 63] as char);
        } else {
            out.push('=');
        }
        if chunk.len() > 2 {
            out.push(B64_ALPHABET[triple as usize & 63] as char);
        } else {
            out.push('=');
        }
    }
    out
}

/// 16 random lowercase hex chars, one per request.
fn trace_id() -> String {
    const HEX: &[u8; 16] = b"abcdef0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| HEX[rng.gen_range(0..16)] as char)
        .collect()
}

/// Opaque search-session id the search endpoint expects: a base36 render
/// of a shifted millisecond timestamp plus a random component.
fn search_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let nonce = u128::from(rand::thread_rng().gen_range(0u64..2_147_483_646));
    base36((millis << 64) | nonce)
}

fn base36(mut value: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Adapter for the Xiaohongshu private web API.
#[derive(Debug, Default)]
pub struct XhsAdapter;

impl XhsAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Builds the `x-s-common` header from the freshly evaluated signature
    /// pair and the session's browser-held material.
    fn common_header(session: &Session, x_s: &str, x_t: &str) -> String {
        let a1 = session.cookie("a1").unwrap_or_default();
        let b1 = session.local_storage("b1").unwrap_or_default();
        let payload = json!({
            "s0": 5,
            "s1": "",
            "x0": "1",
            "x1": "3.6.8",
            "x2": "Windows",
            "x3": "xhs-pc-web",
            "x4": "4.27.2",
            "x5": a1,
            "x6": x_t,
            "x7": x_s,
            "x8": b1,
            "x9": mrc(&format!("{x_t}{x_s}{b1}")),
            "x10": 154,
        });
        custom_b64(compact_json(&payload).as_bytes())
    }
}

#[async_trait]
impl PlatformAdapter for XhsAdapter {
    fn platform(&self) -> Platform {
        Platform::Xhs
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
        // The in-page signer hashes the path with the query attached for
        // GETs and the exact body text for POSTs.
        let query = encode_query(&spec.query);
        let path_and_query = if query.is_empty() {
            spec.path.clone()
        } else {
            format!("{}?{}", spec.path, query)
        };
        let body = spec.body.as_ref().map(compact_json);

        let signature = secrets
            .evaluate_signature(Platform::Xhs, &path_and_query, spec.body.as_ref())
            .await?;
        let x_s = signature
            .get("x-s")
            .ok_or_else(|| SigningError::missing(Platform::Xhs, "x-s"))?
            .to_string();
        let x_t = signature
            .get("x-t")
            .ok_or_else(|| SigningError::missing(Platform::Xhs, "x-t"))?
            .to_string();

        let mut headers = vec![
            ("x-s".to_string(), x_s.clone()),
            ("x-t".to_string(), x_t.clone()),
            (
                "x-s-common".to_string(),
                Self::common_header(session, &x_s, &x_t),
            ),
            ("x-b3-traceid".to_string(), trace_id()),
            ("user-agent".to_string(), BROWSER_USER_AGENT.to_string()),
            ("origin".to_string(), WEB_ORIGIN.to_string()),
            ("referer".to_string(), format!("{WEB_ORIGIN}/")),
        ];
        if !session.is_anonymous() {
            headers.push(("cookie".to_string(), session.cookie_header()));
        }
        headers.extend(session.extra_headers().iter().cloned());

        Ok(SignedRequest {
            platform: Platform::Xhs,
            resource: spec.resource,
            method: spec.method,
            url: format!("{API_HOST}{path_and_query}"),
            headers,
            body,
        })
    }

    fn parse_envelope(
        &self,
        resource: Resource,
        raw: &RawResponse,
        current_cursor: Option<&str>,
    ) -> Result<Envelope, CrawlError> {
        if CAPTCHA_STATUSES.contains(&raw.status) {
            let verify_type = raw.header("verifytype").unwrap_or_default();
            let verify_uuid = raw.header("verifyuuid").unwrap_or_default();
            return Err(CrawlError::platform(
                Platform::Xhs,
                ErrorKind::FrequencyLimited,
                i64::from(raw.status),
                format!("captcha challenge (type={verify_type}, uuid={verify_uuid})"),
            )
            .with_retry_after(raw.retry_after()));
        }

        let envelope = raw.json()?;
        let success = envelope
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = envelope
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string();
            let kind = if code == CODE_IP_BLOCKED {
                ErrorKind::IpBlocked
            } else if CODES_NOT_FOUND.contains(&code) {
                ErrorKind::NotFound
            } else {
                ErrorKind::Unclassified
            };
            return Err(CrawlError::platform(Platform::Xhs, kind, code, message));
        }

        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        match resource {
            Resource::PostDetail | Resource::CreatorInfo => Ok(Envelope::document(data)),
            Resource::SearchPosts | Resource::Ping => {
                let items = data
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let has_more = data.get("has_more").and_then(Value::as_bool).unwrap_or(false);
                // Search paginates by page number; the next cursor is the
                // incremented page the request was issued with.
                let page: u64 = current_cursor.and_then(|c| c.parse().ok()).unwrap_or(1);
                Ok(Envelope::page(
                    data,
                    items,
                    Some((page + 1).to_string()),
                    has_more,
                ))
            }
            Resource::Comments | Resource::SubComments => {
                let items = data
                    .get("comments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let has_more = data.get("has_more").and_then(Value::as_bool).unwrap_or(false);
                let cursor = data
                    .get("cursor")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Envelope::page(data, items, cursor, has_more))
            }
            Resource::CreatorPosts => {
                let items = data
                    .get("notes")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let has_more = data.get("has_more").and_then(Value::as_bool).unwrap_or(false);
                let cursor = data
                    .get("cursor")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(Envelope::page(data, items, cursor, has_more))
            }
        }
    }

    fn search_request(&self, keyword: &str, cursor: Option<&str>) -> RequestSpec {
        let page: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(1);
        RequestSpec::post(
            Resource::SearchPosts,
            "/api/sns/web/v1/search/notes",
            json!({
                "keyword": keyword,
                "page": page,
                "page_size": 20,
                "search_id": search_id(),
                "sort": "general",
                "note_type": 0,
            }),
        )
    }

    fn detail_request(&self, item: &ItemRef) -> RequestSpec {
        RequestSpec::post(
            Resource::PostDetail,
            "/api/sns/web/v1/feed",
            json!({
                "source_note_id": item.id,
                "image_formats": ["jpg", "webp", "avif"],
                "extra": {"need_body_topic": 1},
                "xsec_source": "pc_search",
                "xsec_token": item.extra("xsec_token"),
            }),
        )
    }

    fn comments_request(&self, item: &ItemRef, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::Comments, "/api/sns/web/v2/comment/page")
            .with_param("note_id", &item.id)
            .with_param("cursor", cursor.unwrap_or(""))
            .with_param("top_comment_id", "")
            .with_param("image_formats", "jpg,webp,avif")
            .with_param("xsec_token", item.extra("xsec_token"))
    }

    fn sub_comments_request(
        &self,
        item: &ItemRef,
        root: &Value,
        cursor: Option<&str>,
    ) -> RequestSpec {
        let root_id = root.get("id").and_then(Value::as_str).unwrap_or_default();
        RequestSpec::get(Resource::SubComments, "/api/sns/web/v2/comment/sub/page")
            .with_param("note_id", &item.id)
            .with_param("root_comment_id", root_id)
            .with_param("num", "10")
            .with_param("cursor", cursor.unwrap_or(""))
            .with_param("image_formats", "jpg,webp,avif")
            .with_param("top_comment_id", "")
            .with_param("xsec_token", item.extra("xsec_token"))
    }

    fn root_has_sub_comments(&self, root: &Value) -> bool {
        root.get("sub_comment_has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || root
                .get("sub_comment_count")
                .and_then(|v| v.as_str().and_then(|s| s.parse::<u64>().ok()).or(v.as_u64()))
                .unwrap_or(0)
                > 0
    }

    fn creator_posts_request(&self, creator_id: &str, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::CreatorPosts, "/api/sns/web/v1/user_posted")
            .with_param("num", "30")
            .with_param("cursor", cursor.unwrap_or(""))
            .with_param("user_id", creator_id)
            .with_param("image_formats", "jpg,webp,avif")
    }

    fn creator_info_request(&self, creator_id: &str) -> RequestSpec {
        RequestSpec::get(Resource::CreatorInfo, "/api/sns/web/v1/user/otherinfo")
            .with_param("target_user_id", creator_id)
    }

    fn ping_request(&self) -> RequestSpec {
        // A minimal one-result search doubles as the liveness probe; XHS
        // rejects it with an auth error once the session expires.
        RequestSpec::post(
            Resource::Ping,
            "/api/sns/web/v1/search/notes",
            json!({
                "keyword": "自然",
                "page": 1,
                "page_size": 1,
                "search_id": search_id(),
                "sort": "general",
                "note_type": 0,
            }),
        )
    }

    fn item_refs(&self, resource: Resource, items: &[Value]) -> Vec<ItemRef> {
        items
            .iter()
            .filter_map(|item| match resource {
                Resource::SearchPosts | Resource::Ping => {
                    // Search interleaves notes with ad/banner cards that
                    // carry no note payload.
                    item.get("note_card")?;
                    let id = item.get("id").and_then(Value::as_str)?;
                    let token = item
                        .get("xsec_token")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Some(ItemRef::new(id).with_extra("xsec_token", token))
                }
                _ => {
                    let id = item
                        .get("note_id")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_str)?;
                    let token = item
                        .get("xsec_token")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Some(ItemRef::new(id).with_extra("xsec_token", token))
                }
            })
            .collect()
    }
}
