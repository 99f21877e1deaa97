//! ownCloud/Nextcloud News API v1-2.
//!
//! Subscriptions are keyed by feed title (made unique with trailing `*`);
//! the numeric id for each title is remembered from the last
//! `list_subscriptions` call. A virtual "Starred" feed is always listed.

use super::{
    flag_change, join_url, parse_json, read_state_label, send, Credentials, RemoteApi,
    TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::model::{Dialect, RawEnclosure, RawFeed, RawItem};
use crate::util::format_timestamp;
use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

const API_PATH: &str = "index.php/apps/news/api/v1-2/";

const STARRED: &str = "Starred";

/// `type` parameter of the `items` endpoint.
const ITEMS_OF_FEED: u8 = 0;
const ITEMS_STARRED: u8 = 2;

#[derive(Debug, Clone, Default)]
struct KnownFeed {
    id: i64,
    title: String,
    link: String,
}

pub struct OcNewsApi {
    client: reqwest::Client,
    base: String,
    credentials: Credentials,
    star_flag: Option<char>,
    known_feeds: Mutex<HashMap<String, KnownFeed>>,
}

#[derive(Debug, Deserialize)]
struct Feeds {
    #[serde(default)]
    feeds: Vec<Feed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Feed {
    id: i64,
    title: Option<String>,
    url: Option<String>,
    #[serde(default)]
    folder_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Folders {
    #[serde(default)]
    folders: Vec<Folder>,
}

#[derive(Debug, Deserialize)]
struct Folder {
    id: i64,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Items {
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Item {
    id: i64,
    feed_id: i64,
    guid: Option<String>,
    title: Option<String>,
    url: Option<String>,
    author: Option<String>,
    body: Option<String>,
    enclosure_mime: Option<String>,
    enclosure_link: Option<String>,
    #[serde(default)]
    unread: bool,
    #[serde(default)]
    pub_date: i64,
}

impl OcNewsApi {
    pub fn new(client: reqwest::Client, provider: &ProviderConfig, credentials: Credentials) -> Self {
        if provider.url.is_empty() {
            tracing::error!(service = "ocnews", "No ownCloud server configured");
        }
        Self {
            client,
            base: join_url(&provider.url, API_PATH),
            credentials,
            star_flag: provider.star_flag(),
            known_feeds: Mutex::new(HashMap::new()),
        }
    }

    fn known_feeds(&self) -> MutexGuard<'_, HashMap<String, KnownFeed>> {
        match self.known_feeds.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs one API call. With a body the call is a JSON `PUT`, otherwise a
    /// `GET`. Anything but 200 is a failure.
    async fn query(&self, query: &str, body: Option<serde_json::Value>) -> Option<Vec<u8>> {
        let url = format!("{}{}", self.base, query);
        let mut request = match body {
            Some(body) => self.client.request(Method::PUT, url).json(&body),
            None => self.client.get(url),
        };
        request = request.basic_auth(
            &self.credentials.user,
            Some(self.credentials.pass.expose_secret()),
        );

        let (status, bytes) = send(UrlsSource::Ocnews, query, request).await?;
        match status {
            StatusCode::OK => Some(bytes),
            StatusCode::UNAUTHORIZED => {
                tracing::error!(service = "ocnews", "Authentication error");
                None
            }
            status => {
                tracing::error!(service = "ocnews", query = %query, status = %status, "API error");
                None
            }
        }
    }

    async fn mutate(&self, query: &str, body: serde_json::Value) -> bool {
        self.query(query, Some(body)).await.is_some()
    }
}

/// Item id from a `<id>:<feedId>/<guid>` guid.
fn item_id(guid: &str) -> &str {
    guid.split_once(':').map_or(guid, |(id, _)| id)
}

/// Feed id and original guid from a `<id>:<feedId>/<guid>` guid.
fn feed_and_guid(guid: &str) -> Option<(&str, &str)> {
    let (_, rest) = guid.split_once(':')?;
    rest.split_once('/')
}

fn guid_hash(guid: &str) -> String {
    format!("{:x}", Md5::digest(guid.as_bytes()))
}

fn item_to_raw(index: usize, item: Item) -> RawItem {
    let enclosures = match (item.enclosure_link, item.enclosure_mime) {
        (Some(url), Some(mime_type)) => vec![RawEnclosure {
            url,
            mime_type,
            ..RawEnclosure::default()
        }],
        _ => Vec::new(),
    };
    let original_guid = item.guid.unwrap_or_else(|| index.to_string());

    let mut raw = RawItem {
        title: item.title.unwrap_or_default(),
        link: item.url.unwrap_or_default(),
        author: item.author.unwrap_or_default(),
        content_encoded: item.body.unwrap_or_default(),
        guid: format!("{}:{}/{}", item.id, item.feed_id, original_guid),
        pub_date: format_timestamp(item.pub_date),
        pub_date_ts: Some(item.pub_date),
        enclosures,
        ..RawItem::default()
    };
    raw.labels
        .insert(read_state_label(UrlsSource::Ocnews, item.unread));
    raw
}

#[async_trait]
impl RemoteApi for OcNewsApi {
    fn kind(&self) -> UrlsSource {
        UrlsSource::Ocnews
    }

    async fn authenticate(&self) -> bool {
        if self.credentials.is_empty() {
            tracing::error!(service = "ocnews", "No user and/or password configured");
            return false;
        }
        self.query("status", None).await.is_some()
    }

    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let Some(feeds) = self.query("feeds", None).await else {
            return Vec::new();
        };
        let Some(folders) = self.query("folders", None).await else {
            return Vec::new();
        };
        let Some(feeds) = parse_json::<Feeds>(UrlsSource::Ocnews, "feeds", &feeds) else {
            return Vec::new();
        };
        let folders: HashMap<i64, String> =
            parse_json::<Folders>(UrlsSource::Ocnews, "folders", &folders)
                .map(|f| f.folders)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|f| Some((f.id, f.name?)))
                .collect();

        let mut known = HashMap::new();
        known.insert(
            STARRED.to_string(),
            KnownFeed {
                id: 0,
                title: STARRED.to_string(),
                link: self.base.trim_end_matches(API_PATH).to_string(),
            },
        );

        let mut result = Vec::with_capacity(feeds.feeds.len() + 1);
        for (index, feed) in feeds.feeds.into_iter().enumerate() {
            let mut title = feed.title.unwrap_or_else(|| {
                tracing::warn!(service = "ocnews", index, "Subscription has no title");
                format!("~{}", index)
            });
            while known.contains_key(&title) {
                title.push('*');
            }
            known.insert(
                title.clone(),
                KnownFeed {
                    id: feed.id,
                    title: title.clone(),
                    link: feed.url.unwrap_or_default(),
                },
            );

            let mut tagged = TaggedFeedUrl::new(title.clone(), &title);
            if let Some(folder) = feed
                .folder_id
                .filter(|id| *id != 0)
                .and_then(|id| folders.get(&id))
            {
                tagged.add_tag(folder.clone());
            }
            result.push(tagged);
        }
        result.sort_by(|a, b| a.url.cmp(&b.url));
        result.insert(0, TaggedFeedUrl::new(STARRED, STARRED));

        *self.known_feeds() = known;
        result
    }

    fn serves_content(&self) -> bool {
        true
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let mut feed = RawFeed::empty(Dialect::OcnewsJson);
        let Some(known) = self.known_feeds().get(feed_id).cloned() else {
            tracing::warn!(service = "ocnews", feed = %feed_id, "Unknown feed");
            return feed;
        };
        feed.title = known.title;
        feed.link = known.link;

        let kind = if known.id != 0 {
            ITEMS_OF_FEED
        } else {
            ITEMS_STARRED
        };
        let query = format!("items?type={}&id={}", kind, known.id);
        let Some(body) = self.query(&query, None).await else {
            return feed;
        };
        let Some(items) = parse_json::<Items>(UrlsSource::Ocnews, "items", &body) else {
            return feed;
        };

        feed.items = items
            .items
            .into_iter()
            .enumerate()
            .map(|(index, item)| item_to_raw(index, item))
            .collect();
        feed
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool {
        let id = self
            .known_feeds()
            .get(feed_url)
            .map(|f| f.id)
            .unwrap_or_default();
        let query = format!("feeds/{}/read?newestItemId={}", id, i64::MAX);
        self.mutate(&query, json!({})).await
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        let query = format!(
            "items/{}/{}",
            item_id(guid),
            if read { "read" } else { "unread" }
        );
        self.mutate(&query, json!({})).await
    }

    async fn mark_articles_read(&self, guids: &[String]) -> bool {
        let ids: Vec<i64> = guids
            .iter()
            .filter_map(|guid| item_id(guid).parse().ok())
            .collect();
        self.mutate("items/read/multiple", json!({ "items": ids }))
            .await
    }

    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool {
        let Some(star) = flag_change(old_flags, new_flags, self.star_flag) else {
            return true;
        };
        let Some((feed_id, original_guid)) = feed_and_guid(guid) else {
            tracing::warn!(service = "ocnews", guid = %guid, "Malformed guid");
            return false;
        };
        let query = format!(
            "items/{}/{}/{}",
            feed_id,
            guid_hash(original_guid),
            if star { "star" } else { "unstar" }
        );
        self.mutate(&query, json!({})).await
    }
}
