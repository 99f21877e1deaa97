//! Feedbin REST API v2.

use super::{
    flag_change, join_url, parse_json, read_state_label, send, send_ok, Credentials, RemoteApi,
    TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::model::{Dialect, RawFeed, RawItem};
use crate::util::try_parse_date;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;

const DEFAULT_URL: &str = "https://api.feedbin.com/";

const AUTHENTICATION_PATH: &str = "v2/authentication.json";
const STARRED_ENTRIES_PATH: &str = "v2/starred_entries.json";
const TAGGINGS_PATH: &str = "v2/taggings.json";
const SUBSCRIPTIONS_PATH: &str = "v2/subscriptions.json";
const UNREAD_ENTRIES_PATH: &str = "v2/unread_entries.json";

pub struct FeedbinApi {
    client: reqwest::Client,
    base: String,
    credentials: Credentials,
    star_flag: Option<char>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    feed_id: i64,
    #[serde(default)]
    title: String,
    feed_url: String,
}

#[derive(Debug, Deserialize)]
struct Tagging {
    feed_id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: i64,
    title: Option<String>,
    url: Option<String>,
    author: Option<String>,
    content: Option<String>,
    #[serde(default)]
    published: String,
}

impl FeedbinApi {
    pub fn new(client: reqwest::Client, provider: &ProviderConfig, credentials: Credentials) -> Self {
        let base = if provider.url.is_empty() {
            DEFAULT_URL.to_string()
        } else {
            provider.url.clone()
        };
        Self {
            client,
            base,
            credentials,
            star_flag: provider.star_flag(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, join_url(&self.base, path))
            .basic_auth(
                &self.credentials.user,
                Some(self.credentials.pass.expose_secret()),
            )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Option<T> {
        let body = send_ok(UrlsSource::Feedbin, path, self.request(Method::GET, path)).await?;
        parse_json(UrlsSource::Feedbin, path, &body)
    }

    /// Sends a JSON body and reports whether the service answered 200.
    async fn mutate(&self, method: Method, path: &str, body: serde_json::Value) -> bool {
        let request = self.request(method, path).json(&body);
        matches!(
            send(UrlsSource::Feedbin, path, request).await,
            Some((StatusCode::OK, _))
        )
    }

    async fn mark_entries_read(&self, ids: &[String], read: bool) -> bool {
        let method = if read { Method::DELETE } else { Method::POST };
        let ids: Vec<i64> = ids.iter().filter_map(|id| id.parse().ok()).collect();
        self.mutate(method, UNREAD_ENTRIES_PATH, json!({ "unread_entries": ids }))
            .await
    }

    async fn star_article(&self, guid: &str, star: bool) -> bool {
        let Ok(id) = guid.parse::<i64>() else {
            tracing::warn!(service = "feedbin", guid = %guid, "Entry id is not numeric");
            return false;
        };
        let method = if star { Method::POST } else { Method::DELETE };
        self.mutate(method, STARRED_ENTRIES_PATH, json!({ "starred_entries": [id] }))
            .await
    }
}

fn entries_path(feed_id: &str) -> String {
    format!("v2/feeds/{}/entries.json", feed_id)
}

#[async_trait]
impl RemoteApi for FeedbinApi {
    fn kind(&self) -> UrlsSource {
        UrlsSource::Feedbin
    }

    async fn authenticate(&self) -> bool {
        if self.credentials.is_empty() {
            tracing::warn!(service = "feedbin", "No credentials configured");
            return false;
        }
        let request = self.request(Method::GET, AUTHENTICATION_PATH);
        matches!(
            send(UrlsSource::Feedbin, AUTHENTICATION_PATH, request).await,
            Some((StatusCode::OK, _))
        )
    }

    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let Some(taggings) = self.get_json::<Vec<Tagging>>(TAGGINGS_PATH).await else {
            tracing::warn!(service = "feedbin", "Failed to retrieve taggings");
            return Vec::new();
        };
        let Some(subscriptions) = self.get_json::<Vec<Subscription>>(SUBSCRIPTIONS_PATH).await
        else {
            tracing::warn!(service = "feedbin", "Failed to retrieve subscriptions");
            return Vec::new();
        };

        subscriptions
            .into_iter()
            .map(|sub| {
                let mut feed =
                    TaggedFeedUrl::new(format!("{}#{}", sub.feed_url, sub.feed_id), &sub.title);
                for tagging in taggings.iter().filter(|t| t.feed_id == sub.feed_id) {
                    feed.add_tag(tagging.name.clone());
                }
                feed
            })
            .collect()
    }

    fn serves_content(&self) -> bool {
        true
    }

    fn feed_id<'a>(&self, feed_url: &'a str) -> Option<&'a str> {
        feed_url.split_once('#').map(|(_, id)| id)
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let mut feed = RawFeed::empty(Dialect::FeedbinJson);

        let Some(unread) = self.get_json::<Vec<i64>>(UNREAD_ENTRIES_PATH).await else {
            tracing::warn!(service = "feedbin", "Unread entry ids unavailable");
            return feed;
        };
        let unread: HashSet<i64> = unread.into_iter().collect();

        let Some(entries) = self.get_json::<Vec<Entry>>(&entries_path(feed_id)).await else {
            return feed;
        };
        tracing::debug!(service = "feedbin", feed = %feed_id, items = entries.len(), "Fetched entries");

        feed.items = entries
            .into_iter()
            .map(|entry| {
                let mut item = RawItem {
                    title: entry.title.unwrap_or_default(),
                    link: entry.url.unwrap_or_default(),
                    author: entry.author.unwrap_or_default(),
                    content_encoded: entry.content.unwrap_or_default(),
                    guid: entry.id.to_string(),
                    pub_date_ts: try_parse_date(&entry.published).map(|dt| dt.timestamp()),
                    pub_date: entry.published,
                    ..RawItem::default()
                };
                item.labels.insert(read_state_label(
                    UrlsSource::Feedbin,
                    unread.contains(&entry.id),
                ));
                item
            })
            .collect();
        feed.items
            .sort_by(|a, b| b.pub_date_ts.cmp(&a.pub_date_ts));
        feed
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool {
        let Some(feed_id) = self.feed_id(feed_url) else {
            tracing::warn!(service = "feedbin", feed = %feed_url, "No feed id in URL");
            return false;
        };
        let entries = self
            .get_json::<Vec<Entry>>(&entries_path(feed_id))
            .await
            .unwrap_or_default();
        let ids: Vec<String> = entries.iter().map(|e| e.id.to_string()).collect();
        self.mark_entries_read(&ids, true).await
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        self.mark_entries_read(&[guid.to_string()], read).await
    }

    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool {
        match flag_change(old_flags, new_flags, self.star_flag) {
            Some(star) => self.star_article(guid, star).await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> FeedbinApi {
        let provider = ProviderConfig {
            url: server.uri(),
            flag_star: "*".to_string(),
            ..ProviderConfig::default()
        };
        FeedbinApi::new(
            reqwest::Client::new(),
            &provider,
            Credentials::new("me@example.com", "pw"),
        )
    }

    #[tokio::test]
    async fn test_authenticate_checks_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/authentication.json"))
            .and(basic_auth("me@example.com", "pw"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        assert!(api(&server).authenticate().await);
    }

    #[tokio::test]
    async fn test_fetch_feed_labels_read_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/unread_entries.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([11])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/feeds/3/entries.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 10, "title": "Older", "url": "https://x/10", "author": null,
                 "content": "<p>ten</p>", "published": "2024-01-01T10:00:00.000000Z"},
                {"id": 11, "title": "Newer", "url": "https://x/11", "author": "Ann",
                 "content": "<p>eleven</p>", "published": "2024-01-02T10:00:00.000000Z"}
            ])))
            .mount(&server)
            .await;

        let api = api(&server);
        let feed = api.fetch_feed(api.feed_id("https://x/feed#3").unwrap()).await;

        assert_eq!(feed.dialect, Dialect::FeedbinJson);
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].guid, "11");
        assert!(feed.items[0].labels.contains("feedbin:unread"));
        assert_eq!(feed.items[1].guid, "10");
        assert!(feed.items[1].labels.contains("feedbin:read"));
    }

    #[tokio::test]
    async fn test_star_only_when_flag_changes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/starred_entries.json"))
            .and(body_json(serde_json::json!({"starred_entries": [42]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        assert!(api.update_article_flags("", "*", "42").await);
        assert!(api.update_article_flags("*", "*", "42").await);
    }

    #[tokio::test]
    async fn test_list_subscriptions_attaches_taggings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/taggings.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "feed_id": 3, "name": "Tech"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/subscriptions.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 9, "feed_id": 3, "title": "LWN", "feed_url": "https://lwn.net/rss"},
                {"id": 8, "feed_id": 4, "title": "Blog", "feed_url": "https://blog/feed"}
            ])))
            .mount(&server)
            .await;

        let feeds = api(&server).list_subscriptions().await;
        assert_eq!(
            feeds,
            vec![
                TaggedFeedUrl::new("https://lwn.net/rss#3", "LWN").with_tag("Tech"),
                TaggedFeedUrl::new("https://blog/feed#4", "Blog"),
            ]
        );
    }

    #[test]
    fn test_feed_id_missing_fragment() {
        let api = FeedbinApi::new(
            reqwest::Client::new(),
            &ProviderConfig::default(),
            Credentials::empty(),
        );
        assert_eq!(api.feed_id("https://x/feed"), None);
        assert_eq!(api.base, DEFAULT_URL);
    }
}
