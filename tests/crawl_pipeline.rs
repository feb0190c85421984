//! End-to-end crawl runs against a local HTTP stand-in: context wiring,
//! mode handling, record persistence and the shutdown path.

use std::sync::Arc;
use std::time::Duration;

use crawler_core::{
    CrawlContext, CrawlMode, CrawlRequest, CrawlerConfig, MemorySink, Platform, RecordKind,
    RecordSink, SecretProvider, SessionStore, StaticSecretProvider, StaticSessionStore,
    TransportClient, run_crawl,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn quick_config() -> CrawlerConfig {
    let mut config = CrawlerConfig::default();
    config.crawl_interval_secs = (0.0, 0.0);
    config.batch.group_interval_secs = (0.0, 0.0);
    config.batch.group_timeout_secs = 30;
    config.retry.max_attempts = 1;
    config.enable_sub_comments = false;
    config
}

fn context_for(server_uri: &str, config: CrawlerConfig) -> (CrawlContext, Arc<MemorySink>) {
    let secrets: Arc<dyn SecretProvider> = Arc::new(StaticSecretProvider::default());
    let sessions: Arc<dyn SessionStore> =
        Arc::new(StaticSessionStore::new().with_cookies(Platform::Kuaishou, "did=web_test"));
    let sink = Arc::new(MemorySink::new());
    let sink_handle: Arc<dyn RecordSink> = Arc::clone(&sink) as Arc<dyn RecordSink>;
    let (ctx, _shutdown) = CrawlContext::new(config, secrets, sessions, sink_handle);

    let base = url::Url::parse(server_uri).expect("mock server uri");
    let transport = Arc::new(TransportClient::default().with_host_override(base));
    (ctx.with_transport(transport), sink)
}

fn feed(id: &str) -> serde_json::Value {
    json!({"type": 1, "photo": {"id": id, "caption": format!("video {id}")}})
}

async fn mount_ping_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "visionProfileUserList"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionProfileUserList": {"result": 1, "fols": [], "pcursor": "no_more"}}
        })))
        .mount(server)
        .await;
}

async fn mount_detail(server: &MockServer, id: &str) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(
            json!({"operationName": "visionVideoDetail", "variables": {"photoId": id}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionVideoDetail": {
                "status": 1,
                "photo": {"id": id, "caption": format!("video {id}")},
            }}
        })))
        .mount(server)
        .await;
}

async fn mount_comments(server: &MockServer, id: &str, comment_id: &str) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(
            json!({"operationName": "commentListQuery", "variables": {"photoId": id}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionCommentList": {
                "pcursor": "no_more",
                "rootComments": [
                    {"commentId": comment_id, "content": "nice", "subCommentCount": 0},
                ],
            }}
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_search_crawl_saves_posts_details_and_comments() {
    let server = MockServer::start().await;
    mount_ping_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "visionSearchPhoto"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionSearchPhoto": {
                "result": 1,
                "feeds": [feed("p1"), feed("p2")],
                "pcursor": "no_more",
            }}
        })))
        .mount(&server)
        .await;
    mount_detail(&server, "p1").await;
    mount_detail(&server, "p2").await;
    mount_comments(&server, "p1", "c1").await;
    mount_comments(&server, "p2", "c2").await;

    let (ctx, sink) = context_for(&server.uri(), quick_config());
    let request = CrawlRequest {
        platform: Platform::Kuaishou,
        mode: CrawlMode::Search {
            keywords: vec!["scenery".to_string()],
        },
        account_id: None,
    };
    let summary = run_crawl(&ctx, request).await.expect("crawl");

    assert_eq!(summary.item_count, 2);
    assert_eq!(summary.comment_count, 2);
    assert_eq!(summary.error_count(), 0);
    assert!(!summary.auth_invalid);
    assert!(!summary.cancelled);

    let records = sink.records();
    let posts = records
        .iter()
        .filter(|(_, kind, _)| *kind == RecordKind::Post)
        .count();
    let comments = records
        .iter()
        .filter(|(_, kind, _)| *kind == RecordKind::Comment)
        .count();
    // Two listing items plus their two detail documents.
    assert_eq!(posts, 4);
    assert_eq!(comments, 2);
}

#[tokio::test]
async fn test_detail_crawl_records_failures_per_item() {
    let server = MockServer::start().await;
    mount_ping_ok(&server).await;
    mount_detail(&server, "good1").await;
    mount_comments(&server, "good1", "c1").await;
    // "bad1" answers with a forbidden error.
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(
            json!({"operationName": "visionVideoDetail", "variables": {"photoId": "bad1"}}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": [{"message": "403 Forbidden"}]
        })))
        .mount(&server)
        .await;
    mount_comments(&server, "bad1", "c2").await;

    let (ctx, sink) = context_for(&server.uri(), quick_config());
    let request = CrawlRequest {
        platform: Platform::Kuaishou,
        mode: CrawlMode::Detail {
            ids: vec!["good1".to_string(), "bad1".to_string()],
        },
        account_id: None,
    };
    let summary = run_crawl(&ctx, request).await.expect("crawl");

    assert_eq!(summary.error_count(), 1);
    assert_eq!(summary.failures[0].item_id, "bad1");
    let failures = sink.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, "bad1");
}

#[tokio::test]
async fn test_creator_crawl_saves_profile_and_posts() {
    let server = MockServer::start().await;
    mount_ping_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "visionProfile"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionProfile": {
                "result": 1,
                "userProfile": {"profile": {"user_id": "u1", "user_name": "author"}},
            }}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "visionProfilePhotoList"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"visionProfilePhotoList": {
                "result": 1,
                "feeds": [feed("p1")],
                "pcursor": "no_more",
            }}
        })))
        .mount(&server)
        .await;
    mount_comments(&server, "p1", "c1").await;

    let (ctx, sink) = context_for(&server.uri(), quick_config());
    let request = CrawlRequest {
        platform: Platform::Kuaishou,
        mode: CrawlMode::Creator {
            creator_ids: vec!["u1".to_string()],
        },
        account_id: None,
    };
    let summary = run_crawl(&ctx, request).await.expect("crawl");

    assert_eq!(summary.creator_count, 1);
    assert_eq!(summary.item_count, 1);
    assert_eq!(summary.comment_count, 1);

    let records = sink.records();
    assert!(
        records
            .iter()
            .any(|(_, kind, _)| *kind == RecordKind::Creator)
    );
}

#[tokio::test]
async fn test_missing_signing_secrets_flag_auth_invalid() {
    // Xiaohongshu needs x-s/x-t from the signer; the default provider has
    // neither, so the liveness probe must fail closed without any traffic.
    let server = MockServer::start().await;

    let secrets: Arc<dyn SecretProvider> = Arc::new(StaticSecretProvider::default());
    let sessions: Arc<dyn SessionStore> = Arc::new(StaticSessionStore::new());
    let sink = Arc::new(MemorySink::new());
    let sink_handle: Arc<dyn RecordSink> = Arc::clone(&sink) as Arc<dyn RecordSink>;
    let (ctx, _shutdown) = CrawlContext::new(quick_config(), secrets, sessions, sink_handle);
    let base = url::Url::parse(&server.uri()).expect("uri");
    let ctx = ctx.with_transport(Arc::new(TransportClient::default().with_host_override(base)));

    let request = CrawlRequest {
        platform: Platform::Xhs,
        mode: CrawlMode::Search {
            keywords: vec!["tea".to_string()],
        },
        account_id: None,
    };
    let summary = run_crawl(&ctx, request).await.expect("crawl");

    assert!(summary.auth_invalid);
    assert_eq!(summary.item_count, 0);
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_running_crawl() {
    let server = MockServer::start().await;
    mount_ping_ok(&server).await;
    // Search hangs long enough for the shutdown signal to land first.
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({"operationName": "visionSearchPhoto"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "data": {"visionSearchPhoto": {
                        "result": 1, "feeds": [], "pcursor": "no_more",
                    }}
                }))
                .set_delay(Duration::from_secs(20)),
        )
        .mount(&server)
        .await;

    let secrets: Arc<dyn SecretProvider> = Arc::new(StaticSecretProvider::default());
    let sessions: Arc<dyn SessionStore> =
        Arc::new(StaticSessionStore::new().with_cookies(Platform::Kuaishou, "did=web_test"));
    let sink: Arc<dyn RecordSink> = Arc::new(MemorySink::new());
    let (ctx, shutdown) = CrawlContext::new(quick_config(), secrets, sessions, sink);
    let base = url::Url::parse(&server.uri()).expect("uri");
    let ctx = ctx.with_transport(Arc::new(TransportClient::default().with_host_override(base)));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = shutdown.send(true);
    });

    let request = CrawlRequest {
        platform: Platform::Kuaishou,
        mode: CrawlMode::Search {
            keywords: vec!["scenery".to_string()],
        },
        account_id: None,
    };
    let started = std::time::Instant::now();
    let summary = run_crawl(&ctx, request).await.expect("crawl");

    assert!(summary.cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}
