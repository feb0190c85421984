//! Douyin adapter.
//!
//! Douyin authenticates requests through a large block of device/browser
//! fingerprint query parameters, an `msToken` localStorage value, a stable
//! per-session `webid` nonce and an `a_bogus` signature the in-page signer
//! computes over the final query string and body. The fingerprint table
//! must stay internally consistent (user agent, platform, screen size) or
//! the platform serves empty bodies.

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;

use crate::error::{CrawlError, ErrorKind, SigningError};
use crate::platform::{
    ItemRef, Platform, PlatformAdapter, RequestSpec, Resource, compact_json, encode_query,
};
use crate::session::{SecretProvider, Session};
use crate::transport::{Envelope, RawResponse, SignedRequest};
use crate::user_agent::BROWSER_USER_AGENT;

const API_HOST: &str = "https://www.douyin.com";

/// Fingerprint parameters sent with every request. The values describe one
/// coherent fake device; mixing them with a mismatched user agent gets the
/// session served empty bodies.
const DEVICE_PARAMS: [(&str, &str); 24] = [
    ("device_platform", "webapp"),
    ("aid", "6383"),
    ("channel", "channel_pc_web"),
    ("version_code", "190600"),
    ("version_name", "19.6.0"),
    ("update_version_code", "170400"),
    ("pc_client_type", "1"),
    ("cookie_enabled", "true"),
    ("browser_language", "zh-CN"),
    ("browser_platform", "MacIntel"),
    ("browser_name", "Chrome"),
    ("browser_version", "125.0.0.0"),
    ("browser_online", "true"),
    ("engine_name", "Blink"),
    ("engine_version", "125.0.0.0"),
    ("os_name", "Mac OS"),
    ("os_version", "10.15.7"),
    ("cpu_core_num", "8"),
    ("device_memory", "8"),
    ("platform", "PC"),
    ("screen_width", "2560"),
    ("screen_height", "1440"),
    ("effective_type", "4g"),
    ("round_trip_time", "50"),
];

/// Session secret name holding the msToken the platform issues in-page.
const MS_TOKEN_KEY: &str = "xmst";
/// Session secret name caching the generated webid nonce.
const WEBID_KEY: &str = "webid";

/// A 19-digit numeric device id, generated once per session.
fn fresh_webid() -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(19);
    out.push(char::from(b'1' + rng.gen_range(0u8..9)));
    for _ in 0..18 {
        out.push(char::from(b'0' + rng.gen_range(0u8..10)));
    }
    out
}

/// Adapter for the Douyin private web API.
#[derive(Debug, Default)]
pub struct DouyinAdapter;

impl DouyinAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PlatformAdapter for DouyinAdapter {
    fn platform(&self) -> Platform {
        Platform::Douyin
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
        let ms_token = session
            .local_storage(MS_TOKEN_KEY)
            .ok_or_else(|| SigningError::missing(Platform::Douyin, MS_TOKEN_KEY))?
            .to_string();
        // The webid nonce is generated once and cached so all requests in
        // the session describe the same device.
        let webid = match session.local_storage(WEBID_KEY) {
            Some(existing) => existing.to_string(),
            None => {
                let generated = fresh_webid();
                session.store_secret(WEBID_KEY, generated.clone());
                generated
            }
        };

        let mut query: Vec<(String, String)> = DEVICE_PARAMS
            .iter()
            .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
            .collect();
        query.push(("webid".to_string(), webid));
        query.push(("msToken".to_string(), ms_token));
        query.extend(spec.query.iter().cloned());

        let encoded = encode_query(&query);
        let path_and_query = format!("{}?{}", spec.path, encoded);
        let signature = secrets
            .evaluate_signature(Platform::Douyin, &path_and_query, spec.body.as_ref())
            .await?;
        let a_bogus = signature
            .get("a_bogus")
            .ok_or_else(|| SigningError::missing(Platform::Douyin, "a_bogus"))?;

        let url = format!(
            "{API_HOST}{path_and_query}&a_bogus={}",
            urlencoding::encode(a_bogus)
        );
        let mut headers = vec![
            ("user-agent".to_string(), BROWSER_USER_AGENT.to_string()),
            ("referer".to_string(), format!("{API_HOST}/")),
        ];
        if !session.is_anonymous() {
            headers.push(("cookie".to_string(), session.cookie_header()));
        }
        headers.extend(session.extra_headers().iter().cloned());

        Ok(SignedRequest {
            platform: Platform::Douyin,
            resource: spec.resource,
            method: spec.method,
            url,
            headers,
            body: spec.body.as_ref().map(compact_json),
        })
    }

    fn parse_envelope(
        &self,
        resource: Resource,
        raw: &RawResponse,
        _current_cursor: Option<&str>,
    ) -> Result<Envelope, CrawlError> {
        // Blocked sessions get an empty body (or a bare block notice)
        // with HTTP 200 rather than any JSON envelope.
        let trimmed = raw.body.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("blocked") {
            return Err(CrawlError::platform(
                Platform::Douyin,
                ErrorKind::IpBlocked,
                i64::from(raw.status),
                "empty body, session or address blocked",
            ));
        }

        let envelope = raw.json()?;
        let status_code = envelope
            .get("status_code")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if status_code != 0 {
            let message = envelope
                .get("status_msg")
                .and_then(Value::as_str)
                .unwrap_or("request rejected")
                .to_string();
            return Err(CrawlError::platform(
                Platform::Douyin,
                ErrorKind::Unclassified,
                status_code,
                message,
            ));
        }

        let has_more = envelope.get("has_more").and_then(Value::as_i64).unwrap_or(0) != 0;
        let cursor_of = |field: &str| {
            envelope.get(field).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        };
        match resource {
            Resource::PostDetail => Ok(Envelope::document(
                envelope.get("aweme_detail").cloned().unwrap_or(Value::Null),
            )),
            Resource::CreatorInfo => Ok(Envelope::document(
                envelope.get("user").cloned().unwrap_or(Value::Null),
            )),
            Resource::SearchPosts | Resource::Ping => {
                let items = envelope
                    .get("data")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Ok(Envelope::page(envelope.clone(), items, cursor_of("cursor"), has_more))
            }
            Resource::Comments | Resource::SubComments => {
                let items = envelope
                    .get("comments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Ok(Envelope::page(envelope.clone(), items, cursor_of("cursor"), has_more))
            }
            Resource::CreatorPosts => {
                let items = envelope
                    .get("aweme_list")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                Ok(Envelope::page(
                    envelope.clone(),
                    items,
                    cursor_of("max_cursor"),
                    has_more,
                ))
            }
        }
    }

    fn search_request(&self, keyword: &str, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::SearchPosts, "/aweme/v1/web/general/search/single/")
            .with_param("keyword", keyword)
            .with_param("search_channel", "aweme_general")
            .with_param("search_source", "normal_search")
            .with_param("query_correct_type", "1")
            .with_param("is_filter_search", "0")
            .with_param("offset", cursor.unwrap_or("0"))
            .with_param("count", "10")
    }

    fn detail_request(&self, item: &ItemRef) -> RequestSpec {
        RequestSpec::get(Resource::PostDetail, "/aweme/v1/web/aweme/detail/")
            .with_param("aweme_id", &item.id)
    }

    fn comments_request(&self, item: &ItemRef, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::Comments, "/aweme/v1/web/comment/list/")
            .with_param("aweme_id", &item.id)
            .with_param("cursor", cursor.unwrap_or("0"))
            .with_param("count", "20")
            .with_param("item_type", "0")
    }

    fn sub_comments_request(
        &self,
        item: &ItemRef,
        root: &Value,
        cursor: Option<&str>,
    ) -> RequestSpec {
        let root_id = root.get("cid").and_then(Value::as_str).unwrap_or_default();
        RequestSpec::get(Resource::SubComments, "/aweme/v1/web/comment/list/reply/")
            .with_param("item_id", &item.id)
            .with_param("comment_id", root_id)
            .with_param("cursor", cursor.unwrap_or("0"))
            .with_param("count", "20")
            .with_param("item_type", "0")
    }

    fn root_has_sub_comments(&self, root: &Value) -> bool {
        root.get("reply_comment_total")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            > 0
    }

    fn creator_posts_request(&self, creator_id: &str, cursor: Option<&str>) -> RequestSpec {
        RequestSpec::get(Resource::CreatorPosts, "/aweme/v1/web/aweme/post/")
            .with_param("sec_user_id", creator_id)
            .with_param("count", "18")
            .with_param("max_cursor", cursor.unwrap_or("0"))
            .with_param("locate_query", "false")
            .with_param("publish_video_strategy_type", "2")
    }

    fn creator_info_request(&self, creator_id: &str) -> RequestSpec {
        RequestSpec::get(Resource::CreatorInfo, "/aweme/v1/web/user/profile/other/")
            .with_param("sec_user_id", creator_id)
            .with_param("publish_video_strategy_type", "2")
            .with_param("personal_center_strategy", "1")
    }

    fn ping_request(&self) -> RequestSpec {
        RequestSpec::get(Resource::Ping, "/aweme/v1/web/general/search/single/")
            .with_param("keyword", "自然")
            .with_param("search_channel", "aweme_general")
            .with_param("search_source", "normal_search")
            .with_param("query_correct_type", "1")
            .with_param("is_filter_search", "0")
            .with_param("offset", "0")
            .with_param("count", "1")
    }

    fn item_refs(&self, resource: Resource, items: &[Value]) -> Vec<ItemRef> {
        items
            .iter()
            .filter_map(|item| match resource {
                Resource::SearchPosts | Resource::Ping => {
                    // Search cards wrap the video in aweme_info; mix and
                    // ad cards carry none and are skipped.
                    let id = item
                        .get("aweme_info")
                        .and_then(|info| info.get("aweme_id"))
                        .and_then(Value::as_str)?;
                    Some(ItemRef::new(id))
                }
                _ => {
                    let id = item.get("aweme_id").and_then(Value::as_str)?;
                    Some(ItemRef::new(id))
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn raw(body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            headers: vec![],
            body: body.to_string(),
            url: "https://www.douyin.com/aweme/v1/web/test".to_string(),
        }
    }

    #[test]
    fn test_empty_body_is_ip_block() {
        let err = DouyinAdapter::new()
            .parse_envelope(Resource::SearchPosts, &raw(""), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IpBlocked);

        let err = DouyinAdapter::new()
            .parse_envelope(Resource::Comments, &raw("blocked"), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IpBlocked);
    }

    #[test]
    fn test_comment_page_uses_numeric_cursor() {
        let body = r#"{"status_code":0,"has_more":1,"cursor":20,"comments":[{"cid":"c1"}]}"#;
        let envelope = DouyinAdapter::new()
            .parse_envelope(Resource::Comments, &raw(body), Some("0"))
            .unwrap();
        assert_eq!(envelope.next_cursor.as_deref(), Some("20"));
        assert_eq!(envelope.items.len(), 1);
    }

    #[test]
    fn test_creator_posts_use_max_cursor() {
        let body = r#"{"status_code":0,"has_more":0,"max_cursor":1700000,"aweme_list":[]}"#;
        let envelope = DouyinAdapter::new()
            .parse_envelope(Resource::CreatorPosts, &raw(body), None)
            .unwrap();
        assert_eq!(envelope.next_cursor, None, "exhausted pages drop the cursor");
    }

    #[test]
    fn test_nonzero_status_code_is_platform_error() {
        let body = r#"{"status_code":8,"status_msg":"need login"}"#;
        let err = DouyinAdapter::new()
            .parse_envelope(Resource::PostDetail, &raw(body), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unclassified);
        assert!(err.to_string().contains("need login"));
    }

    #[test]
    fn test_fresh_webid_shape() {
        let id = fresh_webid();
        assert_eq!(id.len(), 19);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
        assert_ne!(id.chars().next(), Some('0'));
    }

    #[test]
    fn test_search_item_refs_skip_cards_without_video() {
        let items = vec![
            json!({"aweme_info": {"aweme_id": "v1"}}),
            json!({"card_unique_name": "ad"}),
        ];
        let refs = DouyinAdapter::new().item_refs(Resource::SearchPosts, &items);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].id, "v1");
    }
}
