//! Miniflux REST API v1. Feeds are identified by their numeric Miniflux id.

use super::{
    flag_change, join_url, parse_json, read_state_label, send, send_ok, BackgroundTasks,
    Credentials, RemoteApi, TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::model::{Dialect, RawFeed, RawItem};
use crate::util::try_parse_date;
use async_trait::async_trait;
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

struct Inner {
    client: reqwest::Client,
    base: String,
    credentials: Credentials,
    star_flag: Option<char>,
    tasks: BackgroundTasks,
}

#[derive(Clone)]
pub struct MinifluxApi {
    inner: Arc<Inner>,
}

#[derive(Debug, Deserialize)]
struct Category {
    id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct Feed {
    id: i64,
    #[serde(default)]
    title: String,
    category: Option<Category>,
}

#[derive(Debug, Deserialize)]
struct Entries {
    #[serde(default)]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    id: i64,
    title: Option<String>,
    url: Option<String>,
    author: Option<String>,
    content: Option<String>,
    #[serde(default)]
    published_at: String,
    #[serde(default)]
    status: String,
}

impl MinifluxApi {
    pub fn new(
        client: reqwest::Client,
        provider: &ProviderConfig,
        credentials: Credentials,
        tasks: BackgroundTasks,
    ) -> Self {
        if provider.url.is_empty() {
            tracing::error!(service = "miniflux", "No Miniflux server configured");
        }
        Self {
            inner: Arc::new(Inner {
                client,
                base: provider.url.clone(),
                credentials,
                star_flag: provider.star_flag(),
                tasks,
            }),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let credentials = &self.inner.credentials;
        self.inner
            .client
            .request(method, join_url(&self.inner.base, path))
            .basic_auth(&credentials.user, Some(credentials.pass.expose_secret()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Option<T> {
        let body = send_ok(UrlsSource::Miniflux, path, self.request(Method::GET, path)).await?;
        parse_json(UrlsSource::Miniflux, path, &body)
    }

    /// `PUT`s `body` to `path`; Miniflux answers mutations with an empty
    /// 2xx response.
    async fn put(&self, path: &str, body: Option<serde_json::Value>) -> bool {
        let mut request = self.request(Method::PUT, path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        matches!(
            send(UrlsSource::Miniflux, path, request).await,
            Some((status, _)) if status.is_success()
        )
    }

    async fn update_entries(&self, guids: &[String], status: &str) -> bool {
        let ids: Vec<i64> = guids.iter().filter_map(|g| g.parse().ok()).collect();
        self.put("v1/entries", Some(json!({ "entry_ids": ids, "status": status })))
            .await
    }

    async fn toggle_bookmark(&self, guid: &str) -> bool {
        self.put(&format!("v1/entries/{}/bookmark", guid), None).await
    }

    async fn entries(&self, feed_id: &str) -> Option<Vec<Entry>> {
        let path = format!(
            "v1/feeds/{}/entries?order=published_at&direction=desc",
            feed_id
        );
        self.get_json::<Entries>(&path).await.map(|e| e.entries)
    }
}

#[async_trait]
impl RemoteApi for MinifluxApi {
    fn kind(&self) -> UrlsSource {
        UrlsSource::Miniflux
    }

    /// Miniflux is stateless basic auth; this only checks that credentials
    /// exist.
    async fn authenticate(&self) -> bool {
        if self.inner.credentials.is_empty() {
            tracing::error!(service = "miniflux", "No user and/or password configured");
            return false;
        }
        true
    }

    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let categories: HashMap<i64, String> = self
            .get_json::<Vec<Category>>("v1/categories")
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|c| (c.id, c.title))
            .collect();

        let Some(feeds) = self.get_json::<Vec<Feed>>("v1/feeds").await else {
            tracing::warn!(service = "miniflux", "Failed to retrieve feed list");
            return Vec::new();
        };

        feeds
            .into_iter()
            .map(|feed| {
                let mut tagged = TaggedFeedUrl::new(feed.id.to_string(), &feed.title);
                if let Some(name) = feed
                    .category
                    .filter(|c| c.id > 0)
                    .and_then(|c| categories.get(&c.id))
                {
                    tagged.add_tag(name.clone());
                }
                tagged
            })
            .collect()
    }

    fn serves_content(&self) -> bool {
        true
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let mut feed = RawFeed::empty(Dialect::MinifluxJson);
        let Some(entries) = self.entries(feed_id).await else {
            return feed;
        };
        tracing::debug!(service = "miniflux", feed = %feed_id, items = entries.len(), "Fetched entries");

        feed.items = entries
            .into_iter()
            .map(|entry| {
                let mut item = RawItem {
                    title: entry.title.unwrap_or_default(),
                    link: entry.url.unwrap_or_default(),
                    author: entry.author.unwrap_or_default(),
                    content_encoded: entry.content.unwrap_or_default(),
                    guid: entry.id.to_string(),
                    pub_date_ts: try_parse_date(&entry.published_at).map(|dt| dt.timestamp()),
                    pub_date: entry.published_at,
                    ..RawItem::default()
                };
                item.labels.insert(read_state_label(
                    UrlsSource::Miniflux,
                    entry.status == "unread",
                ));
                item
            })
            .collect();
        feed.items
            .sort_by(|a, b| b.pub_date_ts.cmp(&a.pub_date_ts));
        feed
    }

    /// Miniflux has no per-feed catch-up endpoint: fetch the entries, then
    /// mark them read in one bulk update.
    async fn mark_all_read(&self, feed_url: &str) -> bool {
        let guids: Vec<String> = self
            .entries(feed_url)
            .await
            .unwrap_or_default()
            .iter()
            .map(|e| e.id.to_string())
            .collect();
        self.update_entries(&guids, "read").await
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        let api = self.clone();
        let guid = guid.to_string();
        self.inner.tasks.spawn(async move {
            tracing::debug!(service = "miniflux", guid = %guid, read, "Updating read state");
            api.update_entries(&[guid], if read { "read" } else { "unread" })
                .await;
        });
        true
    }

    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool {
        match flag_change(old_flags, new_flags, self.inner.star_flag) {
            Some(_) => self.toggle_bookmark(guid).await,
            None => true,
        }
    }
}
