//! Feedly cloud API v3, authenticated with a developer access token.

use super::{
    flag_change, join_url, parse_json, read_state_label, send, send_ok, Credentials, RemoteApi,
    TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::model::{Dialect, RawFeed, RawItem};
use crate::util::format_timestamp;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

const DEFAULT_URL: &str = "https://feedly.com/v3/";

const MARKERS_PATH: &str = "markers";
const MARKER_COUNTS_PATH: &str = "markers/counts";
const STREAMS_PATH: &str = "streams/contents";
const COLLECTIONS_PATH: &str = "collections";

/// Upper bound Feedly accepts for `count` on stream requests.
const STREAM_COUNT: u32 = 1000;

pub struct FeedlyApi {
    client: reqwest::Client,
    base: String,
    token: Option<SecretString>,
    star_flag: Option<char>,
}

#[derive(Debug, Deserialize)]
struct Collection {
    #[serde(default)]
    label: String,
    #[serde(default)]
    feeds: Vec<CollectionFeed>,
}

#[derive(Debug, Deserialize)]
struct CollectionFeed {
    id: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct MarkerCounts {
    #[serde(default)]
    unreadcounts: Vec<UnreadCount>,
}

#[derive(Debug, Deserialize)]
struct UnreadCount {
    id: String,
    #[serde(default)]
    count: i64,
}

#[derive(Debug, Deserialize)]
struct Stream {
    #[serde(default)]
    title: String,
    #[serde(default)]
    items: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: String,
    title: Option<String>,
    author: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    published: i64,
    #[serde(default)]
    unread: bool,
    #[serde(default)]
    alternate: Vec<Link>,
    content: Option<Content>,
    summary: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    content: String,
}

impl FeedlyApi {
    pub fn new(client: reqwest::Client, provider: &ProviderConfig, credentials: Credentials) -> Self {
        let base = if provider.url.is_empty() {
            DEFAULT_URL.to_string()
        } else {
            provider.url.clone()
        };
        Self {
            client,
            base,
            token: credentials.token,
            star_flag: provider.star_flag(),
        }
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.inject_auth_headers(&mut headers);
        headers
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Option<T> {
        let request = self
            .client
            .get(join_url(&self.base, path))
            .headers(self.auth_headers());
        let body = send_ok(UrlsSource::Feedly, path, request).await?;
        parse_json(UrlsSource::Feedly, path, &body)
    }

    async fn post_marker(&self, body: serde_json::Value) -> bool {
        let request = self
            .client
            .post(join_url(&self.base, MARKERS_PATH))
            .headers(self.auth_headers())
            .json(&body);
        matches!(
            send(UrlsSource::Feedly, MARKERS_PATH, request).await,
            Some((status, _)) if status.is_success()
        )
    }

    async fn all_feeds(&self) -> HashMap<String, TaggedFeedUrl> {
        let Some(collections) = self.get_json::<Vec<Collection>>(COLLECTIONS_PATH).await else {
            tracing::warn!(service = "feedly", "Failed to retrieve collections");
            return HashMap::new();
        };

        let mut feeds: HashMap<String, TaggedFeedUrl> = HashMap::new();
        for collection in collections {
            for feed in collection.feeds {
                feeds
                    .entry(feed.id.clone())
                    .or_insert_with(|| TaggedFeedUrl::new(feed.id, &feed.title))
                    .add_tag(collection.label.clone());
            }
        }
        feeds
    }
}

#[async_trait]
impl RemoteApi for FeedlyApi {
    fn kind(&self) -> UrlsSource {
        UrlsSource::Feedly
    }

    /// Checks the token against the marker counts endpoint.
    async fn authenticate(&self) -> bool {
        if self
            .token
            .as_ref()
            .is_none_or(|t| t.expose_secret().is_empty())
        {
            tracing::warn!(service = "feedly", "No access token configured");
            return false;
        }
        self.get_json::<MarkerCounts>(MARKER_COUNTS_PATH)
            .await
            .is_some()
    }

    /// Feeds with unread articles, tagged with their collections.
    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let mut feeds = self.all_feeds().await;
        let Some(counts) = self.get_json::<MarkerCounts>(MARKER_COUNTS_PATH).await else {
            tracing::warn!(service = "feedly", "Failed to retrieve unread counts");
            return Vec::new();
        };

        counts
            .unreadcounts
            .into_iter()
            .filter(|c| c.id.starts_with("feed/") && c.count > 0)
            .filter_map(|c| feeds.remove(&c.id))
            .collect()
    }

    fn serves_content(&self) -> bool {
        true
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let mut feed = RawFeed::empty(Dialect::FeedlyJson);
        let path = format!(
            "{}?count={}&unreadOnly=true&streamId={}",
            STREAMS_PATH,
            STREAM_COUNT,
            utf8_percent_encode(feed_id, NON_ALPHANUMERIC)
        );
        let Some(stream) = self.get_json::<Stream>(&path).await else {
            return feed;
        };

        feed.title = stream.title;
        feed.link = join_url(&self.base, &path);
        // Streams arrive newest first.
        feed.items = stream
            .items
            .into_iter()
            .map(|entry| {
                let published = entry.published / 1000;
                let mut item = RawItem {
                    guid: entry.id,
                    title: entry.title.unwrap_or_default(),
                    author: entry.author.unwrap_or_default(),
                    link: entry
                        .alternate
                        .into_iter()
                        .next()
                        .map(|l| l.href)
                        .unwrap_or_default(),
                    content_encoded: entry.content.map(|c| c.content).unwrap_or_default(),
                    description: entry.summary.map(|c| c.content).unwrap_or_default(),
                    pub_date: format_timestamp(published),
                    pub_date_ts: Some(published),
                    ..RawItem::default()
                };
                item.labels
                    .insert(read_state_label(UrlsSource::Feedly, entry.unread));
                item
            })
            .collect();
        feed
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool {
        tracing::debug!(service = "feedly", feed = %feed_url, "Marking feed read");
        self.post_marker(json!({
            "type": "feeds",
            "action": "markAsRead",
            "feedIds": [feed_url],
        }))
        .await
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        self.post_marker(json!({
            "type": "entries",
            "action": if read { "markAsRead" } else { "keepUnread" },
            "entryIds": [guid],
        }))
        .await
    }

    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool {
        match flag_change(old_flags, new_flags, self.star_flag) {
            Some(star) => {
                self.post_marker(json!({
                    "type": "entries",
                    "action": if star { "markAsSaved" } else { "markAsUnsaved" },
                    "entryIds": [guid],
                }))
                .await
            }
            None => true,
        }
    }

    fn inject_auth_headers(&self, headers: &mut HeaderMap) {
        if let Some(token) = &self.token {
            match HeaderValue::from_str(&format!("Bearer {}", token.expose_secret())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(e) => tracing::warn!(service = "feedly", error = %e, "Invalid access token"),
            }
        }
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> FeedlyApi {
        let provider = ProviderConfig {
            url: format!("{}/v3/", server.uri()),
            flag_star: "s".to_string(),
            ..ProviderConfig::default()
        };
        FeedlyApi::new(
            reqwest::Client::new(),
            &provider,
            Credentials::from_token("tok"),
        )
    }

    #[tokio::test]
    async fn test_list_subscriptions_keeps_feeds_with_unread() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/collections"))
            .and(header("Authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"label": "Tech", "feeds": [
                    {"id": "feed/https://a/rss", "title": "A"},
                    {"id": "feed/https://b/rss", "title": "B"}
                ]}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/markers/counts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "unreadcounts": [
                    {"id": "feed/https://a/rss", "count": 3},
                    {"id": "feed/https://b/rss", "count": 0},
                    {"id": "user/x/category/global.all", "count": 3}
                ]
            })))
            .mount(&server)
            .await;

        let feeds = api(&server).list_subscriptions().await;
        assert_eq!(
            feeds,
            vec![TaggedFeedUrl::new("feed/https://a/rss", "A").with_tag("Tech")]
        );
    }

    #[tokio::test]
    async fn test_fetch_feed_maps_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/streams/contents"))
            .and(query_param("streamId", "feed/https://a/rss"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": "A",
                "items": [{
                    "id": "entry-1", "title": "Hi", "published": 1055217600000i64,
                    "unread": true, "alternate": [{"href": "https://a/1", "type": "text/html"}],
                    "summary": {"content": "short"}
                }]
            })))
            .mount(&server)
            .await;

        let feed = api(&server).fetch_feed("feed/https://a/rss").await;
        assert_eq!(feed.title, "A");
        let item = &feed.items[0];
        assert_eq!(item.link, "https://a/1");
        assert_eq!(item.pub_date_ts, Some(1055217600));
        assert_eq!(item.description, "short");
        assert!(item.labels.contains("feedly:unread"));
    }

    #[tokio::test]
    async fn test_star_marks_saved() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/markers"))
            .and(body_partial_json(json!({"action": "markAsSaved", "entryIds": ["e1"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        assert!(api.update_article_flags("", "s", "e1").await);
        assert!(api.update_article_flags("", "", "e1").await);
    }

    #[test]
    fn test_inject_auth_headers() {
        let api = FeedlyApi::new(
            reqwest::Client::new(),
            &ProviderConfig::default(),
            Credentials::from_token("tok"),
        );
        let mut headers = HeaderMap::new();
        api.inject_auth_headers(&mut headers);
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(api.base, DEFAULT_URL);
    }
}
