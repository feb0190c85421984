//! Kuaishou adapter.
//!
//! Kuaishou's web API is a single GraphQL endpoint with no request
//! signing; the session cookie is the whole credential. Errors surface
//! two ways: a top-level `errors` array classified by message substring,
//! and a per-operation `result` code inside `data`. Pagination uses
//! `pcursor` strings, with the literal `"no_more"` marking exhaustion.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{CrawlError, ErrorKind, SigningError};
use crate::platform::{
    ItemRef, Platform, PlatformAdapter, RequestSpec, Resource, compact_json,
};
use crate::session::{SecretProvider, Session};
use crate::transport::{Envelope, RawResponse, SignedRequest};
use crate::user_agent::BROWSER_USER_AGENT;

const API_HOST: &str = "https://www.kuaishou.com";
const GRAPHQL_PATH: &str = "/graphql";

/// Sentinel pcursor value meaning there is no further page.
const NO_MORE: &str = "no_more";

/// Per-operation result code for a passed request.
const RESULT_OK: i64 = 1;

const SEARCH_QUERY: &str = "fragment photoContent on PhotoEntity {\n  id\n  duration\n  caption\n  likeCount\n  viewCount\n  realLikeCount\n  coverUrl\n  photoUrl\n  liked\n  timestamp\n  expTag\n  animatedCoverUrl\n  stereoType\n  videoRatio\n}\n\nfragment feedContent on Feed {\n  type\n  author {\n    id\n    name\n    headerUrl\n    following\n  }\n  photo {\n    ...photoContent\n  }\n  tags {\n    type\n    name\n  }\n}\n\nquery visionSearchPhoto($keyword: String, $pcursor: String, $searchSessionId: String, $page: String, $webPageArea: String) {\n  visionSearchPhoto(keyword: $keyword, pcursor: $pcursor, searchSessionId: $searchSessionId, page: $page, webPageArea: $webPageArea) {\n    result\n    llsid\n    webPageArea\n    feeds {\n      ...feedContent\n    }\n    searchSessionId\n    pcursor\n    aladdinBanner {\n      imgUrl\n      link\n    }\n  }\n}";

const VIDEO_DETAIL_QUERY: &str = "query visionVideoDetail($photoId: String, $type: String, $page: String, $webPageArea: String) {\n  visionVideoDetail(photoId: $photoId, type: $type, page: $page, webPageArea: $webPageArea) {\n    status\n    type\n    author {\n      id\n      name\n      following\n      headerUrl\n    }\n    photo {\n      id\n      duration\n      caption\n      likeCount\n      realLikeCount\n      coverUrl\n      photoUrl\n      liked\n      timestamp\n      expTag\n      llsid\n      viewCount\n      videoRatio\n      stereoType\n      manifest {\n        mediaType\n        businessType\n        version\n        adaptationSet {\n          id\n          duration\n          representation {\n            id\n            defaultSelect\n            backupUrl\n            codecs\n            url\n            height\n            width\n            avgBitrate\n            maxBitrate\n            frameRate\n            qualityType\n            qualityLabel\n          }\n        }\n      }\n    }\n    tags {\n      type\n      name\n    }\n    commentLimit {\n      canAddComment\n    }\n    llsid\n    danmakuSwitch\n  }\n}";

const COMMENT_LIST_QUERY: &str = "query commentListQuery($photoId: String, $pcursor: String) {\n  visionCommentList(photoId: $photoId, pcursor: $pcursor) {\n    commentCount\n    pcursor\n    rootComments {\n      commentId\n      authorId\n      authorName\n      content\n      headurl\n      timestamp\n      likedCount\n      realLikedCount\n      liked\n      status\n      authorLiked\n      subCommentCount\n      subCommentsPcursor\n      subComments {\n        commentId\n        authorId\n        authorName\n        content\n        headurl\n        timestamp\n        likedCount\n        realLikedCount\n        liked\n        status\n        authorLiked\n        replyToUserName\n        replyTo\n      }\n    }\n  }\n}";

const SUB_COMMENT_LIST_QUERY: &str = "query visionSubCommentList($photoId: String, $pcursor: String, $rootCommentId: String) {\n  visionSubCommentList(photoId: $photoId, pcursor: $pcursor, rootCommentId: $rootCommentId) {\n    pcursor\n    subComments {\n      commentId\n      authorId\n      authorName\n      content\n      headurl\n      timestamp\n      likedCount\n      realLikedCount\n      liked\n      status\n      authorLiked\n      replyToUserName\n      replyTo\n    }\n  }\n}";

const PROFILE_QUERY: &str = "query visionProfile($userId: String) {\n  visionProfile(userId: $userId) {\n    result\n    hostName\n    userProfile {\n      ownerCount {\n        fan\n        photo\n        follow\n        photo_public\n      }\n      profile {\n        gender\n        user_name\n        user_id\n        headurl\n        user_text\n        user_profile_bg_url\n      }\n      isFollowing\n    }\n  }\n}";

const PROFILE_PHOTO_LIST_QUERY: &str = "fragment photoContent on PhotoEntity {\n  id\n  duration\n  caption\n  likeCount\n  viewCount\n  realLikeCount\n  coverUrl\n  photoUrl\n  liked\n  timestamp\n  expTag\n  animatedCoverUrl\n  stereoType\n  videoRatio\n}\n\nfragment feedContent on Feed {\n  type\n  author {\n    id\n    name\n    headerUrl\n    following\n  }\n  photo {\n    ...photoContent\n  }\n  tags {\n    type\n    name\n  }\n}\n\nquery visionProfilePhotoList($pcursor: String, $userId: String, $page: String, $webPageArea: String) {\n  visionProfilePhotoList(pcursor: $pcursor, userId: $userId, page: $page, webPageArea: $webPageArea) {\n    result\n    llsid\n    webPageArea\n    feeds {\n      ...feedContent\n    }\n    hostName\n    pcursor\n  }\n}";

const PROFILE_USER_LIST_QUERY: &str = "query visionProfileUserList($pcursor: String, $ftype: Int) {\n  visionProfileUserList(pcursor: $pcursor, ftype: $ftype) {\n    result\n    fols {\n      user_name\n      headurl\n      user_text\n      isFollowing\n      user_id\n    }\n    hostName\n    pcursor\n  }\n}";

/// Substring rules mapping `errors[].message` to an error kind.
const ERROR_SUBSTRINGS: [(&str, ErrorKind); 6] = [
    ("400002", ErrorKind::FrequencyLimited),
    ("captcha", ErrorKind::FrequencyLimited),
    ("429", ErrorKind::FrequencyLimited),
    ("too many", ErrorKind::FrequencyLimited),
    ("403", ErrorKind::IpBlocked),
    ("forbidden", ErrorKind::IpBlocked),
];

/// GraphQL field inside `data` each resource reads its payload from.
fn data_field(resource: Resource) -> &'static str {
    match resource {
        Resource::SearchPosts => "visionSearchPhoto",
        Resource::PostDetail => "visionVideoDetail",
        Resource::Comments => "visionCommentList",
        Resource::SubComments => "visionSubCommentList",
        Resource::CreatorPosts => "visionProfilePhotoList",
        Resource::CreatorInfo => "visionProfile",
        Resource::Ping => "visionProfileUserList",
    }
}

fn operation(resource: Resource, name: &str, variables: Value, query: &str) -> RequestSpec {
    RequestSpec::post(
        resource,
        GRAPHQL_PATH,
        json!({
            "operationName": name,
            "variables": variables,
            "query": query,
        }),
    )
}

/// Adapter for the Kuaishou GraphQL web API.
#[derive(Debug, Default)]
pub struct KuaishouAdapter;

impl KuaishouAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn classify_message(message: &str) -> ErrorKind {
        let lowered = message.to_lowercase();
        for (needle, kind) in ERROR_SUBSTRINGS {
            if lowered.contains(needle) {
                return kind;
            }
        }
        ErrorKind::Unclassified
    }
}

#[async_trait]
impl PlatformAdapter for KuaishouAdapter {
    fn platform(&self) -> Platform {
        Platform::Kuaishou
    }

    fn api_host(&self) -> &'static str {
        API_HOST
    }

    async fn sign(
        &self,
        session: &mut Session,
        spec: RequestSpec,
        _secrets: &dyn SecretProvider,
    ) -> Result<SignedRequest, SigningError> {
        // No signature scheme; the cookie is the whole credential.
        let mut headers = vec![
            ("user-agent".to_string(), BROWSER_USER_AGENT.to_string()),
            ("origin".to_string(), API_HOST.to_string()),
            ("referer".to_string(), format!("{API_HOST}/")),
        ];
        if !session.is_anonymous() {
            headers.push(("cookie".to_string(), session.cookie_header()));
        }
        headers.extend(session.extra_headers().iter().cloned());
        Ok(SignedRequest {
            platform: Platform::Kuaishou,
            resource: spec.resource,
            method: spec.method,
            url: format!("{API_HOST}{}", spec.path),
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
        let envelope = raw.json()?;

        if let Some(errors) = envelope.get("errors").and_then(Value::as_array) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("graphql error")
                    .to_string();
                return Err(CrawlError::platform(
                    Platform::Kuaishou,
                    Self::classify_message(&message),
                    i64::from(raw.status),
                    message,
                )
                .with_retry_after(raw.retry_after()));
            }
        }

        let data = envelope
            .get("data")
            .and_then(|d| d.get(data_field(resource)))
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(result) = data.get("result").and_then(Value::as_i64) {
            if result != RESULT_OK {
                let kind = Self::classify_message(&result.to_string());
                return Err(CrawlError::platform(
                    Platform::Kuaishou,
                    kind,
                    result,
                    format!("operation {} returned result {result}", data_field(resource)),
                ));
            }
        }

        match resource {
            Resource::PostDetail | Resource::CreatorInfo => Ok(Envelope::document(data)),
            Resource::SearchPosts | Resource::CreatorPosts | Resource::Ping => {
                let items = data
                    .get("feeds")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let pcursor = data
                    .get("pcursor")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let has_more = !pcursor.is_empty() && pcursor != NO_MORE;
                Ok(Envelope::page(data, items, Some(pcursor), has_more))
            }
            Resource::Comments | Resource::SubComments => {
                let field = if resource == Resource::Comments {
                    "rootComments"
                } else {
                    "subComments"
                };
                let items = data
                    .get(field)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let pcursor = data
                    .get("pcursor")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let has_more = !pcursor.is_empty() && pcursor != NO_MORE;
                Ok(Envelope::page(data, items, Some(pcursor), has_more))
            }
        }
    }

    fn search_request(&self, keyword: &str, cursor: Option<&str>) -> RequestSpec {
        operation(
            Resource::SearchPosts,
            "visionSearchPhoto",
            json!({
                "keyword": keyword,
                "pcursor": cursor.unwrap_or(""),
                "page": "search",
            }),
            SEARCH_QUERY,
        )
    }

    fn detail_request(&self, item: &ItemRef) -> RequestSpec {
        operation(
            Resource::PostDetail,
            "visionVideoDetail",
            json!({
                "photoId": item.id,
                "page": "search",
            }),
            VIDEO_DETAIL_QUERY,
        )
    }

    fn comments_request(&self, item: &ItemRef, cursor: Option<&str>) -> RequestSpec {
        operation(
            Resource::Comments,
            "commentListQuery",
            json!({
                "photoId": item.id,
                "pcursor": cursor.unwrap_or(""),
            }),
            COMMENT_LIST_QUERY,
        )
    }

    fn sub_comments_request(
        &self,
        item: &ItemRef,
        root: &Value,
        cursor: Option<&str>,
    ) -> RequestSpec {
        let root_id = root
            .get("commentId")
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        operation(
            Resource::SubComments,
            "visionSubCommentList",
            json!({
                "photoId": item.id,
                "pcursor": cursor.unwrap_or(""),
                "rootCommentId": root_id,
            }),
            SUB_COMMENT_LIST_QUERY,
        )
    }

    fn root_has_sub_comments(&self, root: &Value) -> bool {
        root.get("subCommentCount")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            > 0
    }

    fn creator_posts_request(&self, creator_id: &str, cursor: Option<&str>) -> RequestSpec {
        operation(
            Resource::CreatorPosts,
            "visionProfilePhotoList",
            json!({
                "userId": creator_id,
                "pcursor": cursor.unwrap_or(""),
                "page": "profile",
            }),
            PROFILE_PHOTO_LIST_QUERY,
        )
    }

    fn creator_info_request(&self, creator_id: &str) -> RequestSpec {
        operation(
            Resource::CreatorInfo,
            "visionProfile",
            json!({"userId": creator_id}),
            PROFILE_QUERY,
        )
    }

    fn ping_request(&self) -> RequestSpec {
        operation(
            Resource::Ping,
            "visionProfileUserList",
            json!({"ftype": 1}),
            PROFILE_USER_LIST_QUERY,
        )
    }

    fn item_refs(&self, resource: Resource, items: &[Value]) -> Vec<ItemRef> {
        items
            .iter()
            .filter_map(|item| match resource {
                Resource::SearchPosts | Resource::CreatorPosts | Resource::Ping => {
                    let id = item
                        .get("photo")
                        .and_then(|p| p.get("id"))
                        .and_then(Value::as_str)?;
                    Some(ItemRef::new(id))
                }
                _ => {
                    let id = item.get("commentId").map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })?;
                    Some(ItemRef::new(id))
                }
            })
            .collect()
    }
}
