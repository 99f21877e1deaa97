//! Normalizer behaviour on parsed documents: fallbacks, enclosures, ignore
//! rules and full-page download.

use feedsync::config::{Config, IgnoreRule};
use feedsync::feed::collab::{ConfigIgnores, NoIgnores, PlainTextRenderer};
use feedsync::feed::parser::parse_feed;
use feedsync::feed::model::RawEnclosure;
use feedsync::feed::{CanonicalFeed, Dialect, Normalizer, RawFeed, RawItem};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FEED_URL: &str = "https://blog.example/feed.xml";

async fn normalize(config: &Config, raw: RawFeed) -> CanonicalFeed {
    Normalizer::new(
        config,
        reqwest::Client::new(),
        Arc::new(PlainTextRenderer),
        Arc::new(NoIgnores),
    )
    .normalize(raw, FEED_URL)
    .await
}

fn rss_item(body: &str) -> String {
    rss_document("", body)
}

fn rss_document(channel: &str, item: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/"
     xmlns:dc="http://purl.org/dc/elements/1.1/">
<channel><title>Blog</title><link>https://blog.example/</link>{}
<item>{}</item>
</channel></rss>"#,
        channel, item
    )
}

async fn normalize_document(document: &str) -> CanonicalFeed {
    let raw = parse_feed(document.as_bytes()).unwrap();
    normalize(&Config::default(), raw).await
}

#[tokio::test]
async fn test_guid_from_link_and_date() {
    let raw = RawFeed {
        dialect: Dialect::Rss20,
        items: vec![RawItem {
            title: "t".to_string(),
            link: "http://x/1".to_string(),
            pub_date: "D".to_string(),
            ..RawItem::default()
        }],
        ..RawFeed::default()
    };
    let feed = normalize(&Config::default(), raw).await;
    assert_eq!(feed.items[0].guid, "http://x/1D");
}

#[tokio::test]
async fn test_enclosure_prefers_audio() {
    let image = |n: u32| RawEnclosure {
        url: format!("https://cdn.example/{}.jpg", n),
        mime_type: "image/jpeg".to_string(),
        ..RawEnclosure::default()
    };
    let raw = RawFeed {
        dialect: Dialect::Rss20,
        items: vec![RawItem {
            title: "Episode".to_string(),
            enclosures: vec![
                image(1),
                RawEnclosure {
                    url: "https://cdn.example/ep.mp3".to_string(),
                    mime_type: "audio/mpeg".to_string(),
                    ..RawEnclosure::default()
                },
                image(2),
            ],
            ..RawItem::default()
        }],
        ..RawFeed::default()
    };
    let feed = normalize(&Config::default(), raw).await;
    let enclosure = feed.items[0].enclosure.as_ref().unwrap();
    assert_eq!(enclosure.url, "https://cdn.example/ep.mp3");
    assert_eq!(enclosure.mime_type, "audio/mpeg");
}

#[tokio::test]
async fn test_parsed_rss_item_without_title() {
    let raw = parse_feed(
        rss_item(
            "<link>/2024/05/my-cool-post.html</link>\
             <pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate>\
             <content:encoded>A</content:encoded><description>B</description>",
        )
        .as_bytes(),
    )
    .unwrap();

    let config = Config {
        always_display_description: true,
        ..Config::default()
    };
    let feed = normalize(&config, raw).await;
    let item = &feed.items[0];

    assert_eq!(feed.title, "Blog");
    assert_eq!(item.title, "My cool post");
    assert_eq!(item.link, "https://blog.example/2024/05/my-cool-post.html");
    assert_eq!(item.pub_date, "Tue, 10 Jun 2003 04:00:00 +0000");
    assert_eq!(item.pub_date_ts, 1055217600);
    assert_eq!(item.description, "A<hr>B");
    assert_eq!(item.feed_url, FEED_URL);
    assert!(item.unread);
    assert!(!item.override_unread);
}

#[tokio::test]
async fn test_ignore_rules_drop_items() {
    let mut config = Config::default();
    config.ignore_article = vec![IgnoreRule {
        feed: FEED_URL.to_string(),
        title: "^Sponsored".to_string(),
    }];
    let item = |title: &str| RawItem {
        title: title.to_string(),
        ..RawItem::default()
    };
    let raw = RawFeed {
        dialect: Dialect::Rss20,
        items: vec![item("Sponsored: gadgets"), item("Real news")],
        ..RawFeed::default()
    };

    let feed = Normalizer::new(
        &config,
        reqwest::Client::new(),
        Arc::new(PlainTextRenderer),
        Arc::new(ConfigIgnores::from_config(&config)),
    )
    .normalize(raw, FEED_URL)
    .await;

    let titles: Vec<&str> = feed.items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Real news"]);
}

#[tokio::test]
async fn test_full_page_download_for_empty_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(
                "<html><body>Full text</body></html>",
                "text/html; charset=utf-8",
            ),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"raw".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        download_full_page: true,
        ..Config::default()
    };
    let raw = RawFeed {
        dialect: Dialect::Rss20,
        items: vec![
            RawItem {
                title: "With page".to_string(),
                link: format!("{}/article", server.uri()),
                ..RawItem::default()
            },
            RawItem {
                title: "Opaque".to_string(),
                link: format!("{}/blob", server.uri()),
                ..RawItem::default()
            },
            RawItem {
                title: "Has content".to_string(),
                link: format!("{}/never", server.uri()),
                description: "inline".to_string(),
                ..RawItem::default()
            },
        ],
        ..RawFeed::default()
    };

    let feed = normalize(&config, raw).await;
    assert_eq!(feed.items[0].description, "<html><body>Full text</body></html>");
    assert_eq!(feed.items[0].description_mime, "text/html");
    assert_eq!(feed.items[1].description, "raw");
    assert_eq!(feed.items[1].description_mime, "application/octet-stream");
    assert_eq!(feed.items[2].description, "inline");
}

// ============================================================================
// Parsed documents
// ============================================================================

#[tokio::test]
async fn test_item_author_display_name() {
    let feed = normalize_document(&rss_document(
        "<managingEditor>ed@b.example (Ed)</managingEditor>",
        "<title>t</title><author>jo@b.example (Jo)</author>",
    ))
    .await;
    assert_eq!(feed.items[0].author, "Jo");
}

#[tokio::test]
async fn test_author_falls_back_to_managing_editor() {
    let feed = normalize_document(&rss_document(
        "<managingEditor>ed@b.example (Ed)</managingEditor>\
         <dc:creator>Creator</dc:creator>",
        "<title>t</title>",
    ))
    .await;
    assert_eq!(feed.items[0].author, "Ed");
}

#[tokio::test]
async fn test_author_falls_back_to_channel_creator() {
    let feed = normalize_document(&rss_document(
        "<dc:creator>Creator</dc:creator>",
        "<title>t</title>",
    ))
    .await;
    assert_eq!(feed.items[0].author, "Creator");
}

#[tokio::test]
async fn test_guid_joins_link_and_wire_pub_date() {
    let feed = normalize_document(&rss_item(
        "<title>t</title><link>https://b.example/1</link>\
         <pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate>",
    ))
    .await;
    let item = &feed.items[0];
    assert_eq!(item.guid, "https://b.example/1Tue, 10 Jun 2003 04:00:00 GMT");
    assert_eq!(item.pub_date_ts, 1055217600);
}

#[tokio::test]
async fn test_unparseable_pub_date_still_feeds_guid() {
    let before = chrono::Utc::now().timestamp();
    let feed = normalize_document(&rss_item(
        "<title>t</title><link>https://b.example/1</link><pubDate>June 10th 2003</pubDate>",
    ))
    .await;
    let item = &feed.items[0];
    assert_eq!(item.guid, "https://b.example/1June 10th 2003");
    assert!(item.pub_date_ts >= before);
}

#[tokio::test]
async fn test_item_xml_base_resolves_links() {
    let document = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Blog</title><link>https://blog.example/</link>
<item xml:base="https://cdn.b.example/posts/">
  <title>t</title><link>1.html</link>
  <enclosure url="1.mp3" type="audio/mpeg" length="1"/>
</item>
</channel></rss>"#;
    let feed = normalize_document(document).await;
    let item = &feed.items[0];
    assert_eq!(item.link, "https://cdn.b.example/posts/1.html");
    assert_eq!(item.base, "https://cdn.b.example/posts/");
    assert_eq!(
        item.enclosure.as_ref().unwrap().url,
        "https://cdn.b.example/posts/1.mp3"
    );
}
