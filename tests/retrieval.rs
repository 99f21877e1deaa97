//! End-to-end retrieval tests: dispatcher, remote adapters and normalizer
//! composed the way the binary composes them, against mock servers.

use feedsync::config::{Config, ProviderConfig, UrlsSource};
use feedsync::feed::collab::{MemoryValidatorCache, NoIgnores, PlainTextRenderer, ValidatorCache};
use feedsync::feed::{Dialect, Normalizer, RetrieveError, Retriever};
use feedsync::remote::{
    BackgroundTasks, Credentials, FeedbinApi, GReaderApi, GReaderFlavor, RemoteApi,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Stream</title>
  <id>tag:example.com,2024:stream</id>
  <updated>2024-03-01T12:00:00Z</updated>
  <entry>
    <title>Seen</title>
    <id>tag:example.com,2024:1</id>
    <link href="https://example.com/1"/>
    <updated>2024-03-01T12:00:00Z</updated>
    <category term="user/1005/state/com.google/read" scheme="http://www.google.com/reader/" label="read"/>
  </entry>
  <entry>
    <title>Fresh</title>
    <id>tag:example.com,2024:2</id>
    <link href="https://example.com/2"/>
    <updated>2024-03-02T12:00:00Z</updated>
    <category term="user/1005/state/com.google/fresh" scheme="http://www.google.com/reader/" label="fresh"/>
  </entry>
</feed>"#;

fn normalizer(config: &Config) -> Normalizer {
    Normalizer::new(
        config,
        reqwest::Client::new(),
        Arc::new(PlainTextRenderer),
        Arc::new(NoIgnores),
    )
}

fn retriever(config: &Config, cache: Arc<dyn ValidatorCache>) -> Retriever {
    Retriever::new(config, reqwest::Client::new(), cache, Arc::new(NoIgnores))
}

// ============================================================================
// Conditional GET
// ============================================================================

#[tokio::test]
async fn test_second_download_sends_cached_validators() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("If-None-Match", "\"E\""))
        .and(header("If-Modified-Since", "Tue, 10 Jun 2003 04:00:00 GMT"))
        .respond_with(ResponseTemplate::new(304))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(ATOM)
                .insert_header("ETag", "\"E\"")
                .insert_header("Last-Modified", "Tue, 10 Jun 2003 04:00:00 GMT"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        download_retries: 2,
        ..Config::default()
    };
    let retriever = retriever(&config, Arc::new(MemoryValidatorCache::new()));
    let url = format!("{}/atom.xml", server.uri());

    let first = retriever.retrieve(&url).await.unwrap();
    assert_eq!(first.dialect, Dialect::Atom10);

    match retriever.retrieve(&url).await {
        Err(RetrieveError::RetryExhausted { not_modified, .. }) => assert!(not_modified),
        other => panic!("Expected RetryExhausted, got {:?}", other),
    }
}

// ============================================================================
// Provider mode
// ============================================================================

#[tokio::test]
async fn test_feedbin_read_state_reaches_canonical_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/unread_entries.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([2])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/feeds/9/entries.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": 1, "title": "Old", "url": "https://blog.example/old",
             "content": "<p>old</p>", "published": "2024-01-01T10:00:00.000000Z"},
            {"id": 2, "title": "New", "url": "https://blog.example/new",
             "content": "<p>new</p>", "published": "2024-01-02T10:00:00.000000Z"}
        ])))
        .mount(&server)
        .await;

    let config = Config {
        urls_source: UrlsSource::Feedbin,
        ..Config::default()
    };
    let provider = ProviderConfig {
        url: server.uri(),
        ..ProviderConfig::default()
    };
    let api: Arc<dyn RemoteApi> = Arc::new(FeedbinApi::new(
        reqwest::Client::new(),
        &provider,
        Credentials::new("me@example.com", "pw"),
    ));
    let retriever =
        retriever(&config, Arc::new(MemoryValidatorCache::new())).with_api(Some(api));

    let feed_url = "https://blog.example/feed.xml#9";
    let raw = retriever.retrieve(feed_url).await.unwrap();
    let feed = normalizer(&config).normalize(raw, feed_url).await;

    let state: Vec<(&str, bool, bool)> = feed
        .items
        .iter()
        .map(|i| (i.guid.as_str(), i.unread, i.override_unread))
        .collect();
    assert_eq!(state, vec![("2", true, true), ("1", false, true)]);
    assert_eq!(feed.items[0].pub_date, "Tue, 02 Jan 2024 10:00:00 +0000");
    assert_eq!(feed.items[0].description, "<p>new</p>");
}

#[tokio::test]
async fn test_inoreader_feeds_use_http_with_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/accounts/ClientLogin"))
        .respond_with(ResponseTemplate::new(200).set_body_string("SID=x\nLSID=y\nAuth=secret\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/reader/atom/feed/1"))
        .and(header("Authorization", "GoogleLogin auth=secret"))
        .and(header("appid", "1000"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ATOM))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        urls_source: UrlsSource::Inoreader,
        ..Config::default()
    };
    let provider = ProviderConfig {
        url: server.uri(),
        app_id: Some("1000".to_string()),
        app_key: Some("key".to_string()),
        ..ProviderConfig::default()
    };
    let tasks = BackgroundTasks::new();
    let api = GReaderApi::new(
        GReaderFlavor::Inoreader,
        reqwest::Client::new(),
        &provider,
        Credentials::new("me", "pw"),
        tasks.clone(),
    );
    assert!(api.authenticate().await);
    assert!(!api.serves_content());

    let retriever = retriever(&config, Arc::new(MemoryValidatorCache::new()))
        .with_api(Some(Arc::new(api)));
    let feed_url = format!("{}/reader/atom/feed/1", server.uri());
    let raw = retriever.retrieve(&feed_url).await.unwrap();
    let feed = normalizer(&config).normalize(raw, &feed_url).await;

    assert_eq!(feed.title, "Stream");
    let seen = feed.items.iter().find(|i| i.title == "Seen").unwrap();
    let fresh = feed.items.iter().find(|i| i.title == "Fresh").unwrap();
    assert!(!seen.unread && seen.override_unread);
    assert!(fresh.unread && fresh.override_unread);
    tasks.shutdown().await;
}

// ============================================================================
// Local branches
// ============================================================================

#[tokio::test]
async fn test_unsupported_scheme_message() {
    let err = retriever(&Config::default(), Arc::new(MemoryValidatorCache::new()))
        .retrieve("mailto:feeds@example.com")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Error: unsupported URL: mailto:feeds@example.com");
}

#[tokio::test]
async fn test_query_feed_needs_no_network() {
    // Unroutable address: any I/O would fail or hang
    let config = Config {
        download_timeout: 1,
        ..Config::default()
    };
    let raw = retriever(&config, Arc::new(MemoryValidatorCache::new()))
        .retrieve("query:Unread Articles:unread = \"yes\"")
        .await
        .unwrap();
    assert_eq!(raw.dialect, Dialect::Unknown);
    assert!(raw.items.is_empty());
}
