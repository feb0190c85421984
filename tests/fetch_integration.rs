//! Integration tests for the fetcher against a local HTTP stand-in.
//!
//! Kuaishou is the platform under test because its adapter needs no
//! signature evaluation; the pipeline from request construction through
//! envelope classification runs unmodified.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crawler_core::{
    BrowserSignature, ErrorKind, Fetcher, ItemRef, Pacing, Platform, ProxyPool, RetryPolicy,
    Session, SessionSecrets, StaticSecretProvider, Strategy, TransportClient,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        ip_block_wait: (Duration::from_millis(1), Duration::from_millis(2)),
        frequency_wait: (Duration::from_millis(1), Duration::from_millis(2)),
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn fetcher_for(server_uri: &str, retry: RetryPolicy) -> Fetcher {
    let base = url::Url::parse(server_uri).expect("mock server uri");
    let transport = Arc::new(TransportClient::default().with_host_override(base));
    Fetcher::new(
        Platform::Kuaishou,
        Session::from_cookie_str("did=web_test"),
        transport,
        Arc::new(ProxyPool::new(Strategy::RoundRobin)),
        Arc::new(StaticSecretProvider::default()),
        retry,
        Pacing::none(),
    )
}

fn feed(id: &str) -> serde_json::Value {
    json!({"type": 1, "photo": {"id": id, "caption": format!("video {id}")}})
}

#[tokio::test]
async fn test_search_collects_across_pages_until_no_more() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"variables": {"pcursor": ""}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSearchPhoto": {
                "result": 1,
                "feeds": [feed("p1"), feed("p2")],
                "pcursor": "page2",
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"variables": {"pcursor": "page2"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSearchPhoto": {
                "result": 1,
                "feeds": [feed("p3")],
                "pcursor": "no_more",
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server.uri(), quick_retry(1));
    let items = fetcher.search("scenery", 10).await.expect("search");
    assert_eq!(items.len(), 3);

    let refs = fetcher.item_refs(crawler_core::Resource::SearchPosts, &items);
    let ids: Vec<&str> = refs.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["p1", "p2", "p3"]);
}

#[tokio::test]
async fn test_search_truncates_at_limit_without_extra_requests() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSearchPhoto": {
                "result": 1,
                "feeds": [feed("p1"), feed("p2"), feed("p3"), feed("p4")],
                "pcursor": "live-cursor",
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server.uri(), quick_retry(1));
    let items = fetcher.search("scenery", 2).await.expect("search");
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_captcha_error_surfaces_as_frequency_limited() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{"message": "error 400002: captcha required"}]
        })))
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server.uri(), quick_retry(1));
    let err = fetcher.search("scenery", 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FrequencyLimited);
}

#[tokio::test]
async fn test_rate_limit_recovers_on_retry() {
    let server = MockServer::start().await;

    // First try hits the limit, second succeeds.
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{"message": "429 too many requests"}]
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSearchPhoto": {
                "result": 1,
                "feeds": [feed("p1")],
                "pcursor": "no_more",
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server.uri(), quick_retry(2));
    let items = fetcher.search("scenery", 10).await.expect("retried search");
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_comments_include_sub_comment_pages() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "commentListQuery"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionCommentList": {
                "commentCount": 2,
                "pcursor": "no_more",
                "rootComments": [
                    {"commentId": "c1", "content": "first", "subCommentCount": 2},
                    {"commentId": "c2", "content": "second", "subCommentCount": 0},
                ],
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(
            json!({"operationName": "visionSubCommentList", "variables": {"rootCommentId": "c1"}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSubCommentList": {
                "pcursor": "no_more",
                "subComments": [
                    {"commentId": "c1-1", "content": "reply one"},
                    {"commentId": "c1-2", "content": "reply two"},
                ],
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server.uri(), quick_retry(1));
    let comments = fetcher
        .comments(&ItemRef::new("p1"), 50, 50, true)
        .await
        .expect("comments");
    assert_eq!(comments.len(), 4);
}

#[tokio::test]
async fn test_sub_comments_skipped_when_disabled() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "commentListQuery"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionCommentList": {
                "pcursor": "no_more",
                "rootComments": [
                    {"commentId": "c1", "content": "first", "subCommentCount": 5},
                ],
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher_for(&server.uri(), quick_retry(1));
    let comments = fetcher
        .comments(&ItemRef::new("p1"), 50, 50, false)
        .await
        .expect("comments");
    assert_eq!(comments.len(), 1);
}

#[tokio::test]
async fn test_sub_comment_limit_does_not_eat_the_root_quota() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "commentListQuery"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionCommentList": {
                "pcursor": "no_more",
                "rootComments": [
                    {"commentId": "c1", "content": "first", "subCommentCount": 3},
                    {"commentId": "c2", "content": "second", "subCommentCount": 0},
                ],
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(
            json!({"operationName": "visionSubCommentList", "variables": {"rootCommentId": "c1"}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSubCommentList": {
                "pcursor": "no_more",
                "subComments": [
                    {"commentId": "c1-1", "content": "reply one"},
                    {"commentId": "c1-2", "content": "reply two"},
                    {"commentId": "c1-3", "content": "reply three"},
                ],
            }}
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Two quotas of two: a reply-heavy first root must not push the
    // second root out, and its replies stop at the sub-comment cap.
    let fetcher = fetcher_for(&server.uri(), quick_retry(1));
    let comments = fetcher
        .comments(&ItemRef::new("p1"), 2, 2, true)
        .await
        .expect("comments");
    let ids: Vec<&str> = comments
        .iter()
        .map(|c| c["commentId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["c1", "c1-1", "c1-2", "c2"]);
}

#[tokio::test]
async fn test_sequential_douyin_signatures_reuse_the_session_nonce() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/aweme/v1/web/aweme/detail/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status_code": 0,
            "aweme_detail": {"aweme_id": "v1"},
        })))
        .expect(2)
        .mount(&server)
        .await;

    // Douyin signing carries per-session state: the msToken comes from
    // localStorage and the webid nonce is minted on the first request,
    // so the second signature must still be complete and must describe
    // the same device.
    let mut session = Session::new();
    session.replace_secrets(SessionSecrets {
        cookies: BTreeMap::new(),
        local_storage: BTreeMap::from([("xmst".to_string(), "token-123".to_string())]),
    });
    let secrets = StaticSecretProvider::new(
        SessionSecrets::default(),
        BrowserSignature {
            values: BTreeMap::from([("a_bogus".to_string(), "sig-abc".to_string())]),
        },
    );
    let base = url::Url::parse(&server.uri()).expect("mock server uri");
    let fetcher = Fetcher::new(
        Platform::Douyin,
        session,
        Arc::new(TransportClient::default().with_host_override(base)),
        Arc::new(ProxyPool::new(Strategy::RoundRobin)),
        Arc::new(secrets),
        quick_retry(1),
        Pacing::none(),
    );

    let item = ItemRef::new("v1");
    fetcher.post_detail(&item).await.expect("first detail");
    fetcher.post_detail(&item).await.expect("second detail");

    let requests = server.received_requests().await.expect("recorded requests");
    assert_eq!(requests.len(), 2);
    let param = |i: usize, name: &str| -> String {
        requests[i]
            .url
            .query_pairs()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_else(|| panic!("request {i} missing {name}"))
    };
    for i in 0..2 {
        assert_eq!(param(i, "msToken"), "token-123");
        assert_eq!(param(i, "a_bogus"), "sig-abc");
        assert!(!param(i, "webid").is_empty());
    }
    assert_eq!(param(0, "webid"), param(1, "webid"));
}

#[tokio::test]
async fn test_connection_refused_maps_to_transient_network() {
    // Bind a port, then free it so nothing listens there.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let fetcher = fetcher_for(&format!("http://127.0.0.1:{port}"), quick_retry(1));
    let err = fetcher.search("scenery", 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientNetwork);
}
