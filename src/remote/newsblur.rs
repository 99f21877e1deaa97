//! NewsBlur web API. Authentication is a session cookie obtained from
//! `/api/login` and kept in a cookie jar, persisted to `cookie_cache` when
//! one is configured.

use super::{
    join_url, parse_json, read_state_label, send_ok, Credentials, RemoteApi, TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::http::{read_limited_bytes, FetchError, MAX_FEED_SIZE};
use crate::feed::model::{Dialect, RawFeed, RawItem};
use crate::util::{format_timestamp, try_parse_date};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::SET_COOKIE;
use reqwest::ClientBuilder;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_URL: &str = "https://newsblur.com";

const ITEMS_PER_PAGE: u32 = 6;

/// Separates feed id and story id in article guids.
const ID_SEPARATOR: &str = "[#]";

#[derive(Debug, Clone, Default)]
struct KnownFeed {
    title: String,
    link: String,
}

pub struct NewsBlurApi {
    client: reqwest::Client,
    base: String,
    credentials: Credentials,
    min_pages: u32,
    cookie_cache: Option<PathBuf>,
    known_feeds: Mutex<HashMap<String, KnownFeed>>,
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    #[serde(default)]
    authenticated: bool,
}

#[derive(Debug, Deserialize)]
struct FeedsReply {
    #[serde(default)]
    feeds: BTreeMap<String, FeedInfo>,
    #[serde(default)]
    folders: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct FeedInfo {
    feed_title: Option<String>,
    feed_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoriesReply {
    stories: Vec<Story>,
}

#[derive(Debug, Deserialize)]
struct Story {
    #[serde(default)]
    id: String,
    story_title: Option<String>,
    story_authors: Option<String>,
    story_permalink: Option<String>,
    story_content: Option<String>,
    story_date: Option<String>,
    read_status: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ResultReply {
    #[serde(default)]
    result: String,
}

impl NewsBlurApi {
    /// Builds the client with a cookie jar preloaded from `cookie_cache`.
    pub fn new(
        builder: ClientBuilder,
        provider: &ProviderConfig,
        credentials: Credentials,
        cookie_cache: Option<PathBuf>,
    ) -> Result<Self, FetchError> {
        let base = if provider.url.is_empty() {
            DEFAULT_URL.to_string()
        } else {
            provider.url.clone()
        };

        let jar = Arc::new(Jar::default());
        match &cookie_cache {
            Some(path) => load_cookies(&jar, path, &base),
            None => tracing::warn!(
                service = "newsblur",
                "No cookie_cache configured; the session will not survive restarts"
            ),
        }

        Ok(Self {
            client: builder.cookie_provider(jar).build()?,
            base,
            credentials,
            min_pages: (provider.min_items + ITEMS_PER_PAGE + 1) / ITEMS_PER_PAGE,
            cookie_cache,
            known_feeds: Mutex::new(HashMap::new()),
        })
    }

    fn known_feeds(&self) -> MutexGuard<'_, HashMap<String, KnownFeed>> {
        match self.known_feeds.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Option<T> {
        let request = self.client.get(join_url(&self.base, endpoint));
        let body = send_ok(UrlsSource::Newsblur, endpoint, request).await?;
        parse_json(UrlsSource::Newsblur, endpoint, &body)
    }

    async fn post_ok(&self, endpoint: &str, form: &[(&str, &str)]) -> bool {
        let request = self.client.post(join_url(&self.base, endpoint)).form(form);
        send_ok(UrlsSource::Newsblur, endpoint, request)
            .await
            .and_then(|body| parse_json::<ResultReply>(UrlsSource::Newsblur, endpoint, &body))
            .is_some_and(|reply| reply.result == "ok")
    }

    async fn save_cookies(&self, cookies: &[String]) {
        let Some(path) = &self.cookie_cache else {
            return;
        };
        if cookies.is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::write(path, cookies.join("\n")).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write cookie cache");
        }
    }
}

/// Adds each line of the cookie cache to `jar` as a `Set-Cookie` value.
fn load_cookies(jar: &Jar, path: &Path, base: &str) {
    let Ok(url) = url::Url::parse(base) else {
        tracing::warn!(service = "newsblur", url = %base, "Invalid service URL");
        return;
    };
    match std::fs::read_to_string(path) {
        Ok(content) => {
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                jar.add_cookie_str(line, &url);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read cookie cache")
        }
    }
}

/// Maps feed ids to the names of the top-level folders that contain them.
/// Bare ids in `folders` are unfiled feeds and carry no tag.
fn feeds_to_tags(folders: &[Value]) -> HashMap<String, Vec<String>> {
    let mut result: HashMap<String, Vec<String>> = HashMap::new();
    for folder in folders.iter().filter_map(Value::as_object) {
        for (name, members) in folder {
            let ids = members.as_array().map(Vec::as_slice).unwrap_or_default();
            for id in ids {
                let id = match id {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    _ => continue,
                };
                result.entry(id).or_default().push(name.clone());
            }
        }
    }
    result
}

fn story_to_item(feed_id: &str, story: Story) -> RawItem {
    let ts = story
        .story_date
        .as_deref()
        .and_then(try_parse_date)
        .unwrap_or_else(chrono::Utc::now)
        .timestamp();

    let mut item = RawItem {
        title: story.story_title.unwrap_or_default(),
        author: story.story_authors.unwrap_or_default(),
        link: story.story_permalink.unwrap_or_default(),
        content_encoded: story.story_content.unwrap_or_default(),
        guid: format!("{}{}{}", feed_id, ID_SEPARATOR, story.id),
        pub_date: format_timestamp(ts),
        pub_date_ts: Some(ts),
        ..RawItem::default()
    };
    if let Some(status) = story.read_status {
        item.labels
            .insert(read_state_label(UrlsSource::Newsblur, status == 0));
    }
    item
}

#[async_trait]
impl RemoteApi for NewsBlurApi {
    fn kind(&self) -> UrlsSource {
        UrlsSource::Newsblur
    }

    async fn authenticate(&self) -> bool {
        if self.credentials.is_empty() {
            tracing::error!(service = "newsblur", "No user and/or password configured");
            return false;
        }

        let form = [
            ("username", self.credentials.user.as_str()),
            ("password", self.credentials.pass.expose_secret()),
        ];
        let request = self
            .client
            .post(join_url(&self.base, "api/login"))
            .form(&form);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(service = "newsblur", error = %e, "Login request failed");
                return false;
            }
        };

        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = match read_limited_bytes(response, MAX_FEED_SIZE).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(service = "newsblur", error = %e, "Login response unreadable");
                return false;
            }
        };

        let authenticated = parse_json::<LoginReply>(UrlsSource::Newsblur, "api/login", &body)
            .is_some_and(|reply| reply.authenticated);
        if authenticated {
            self.save_cookies(&cookies).await;
        }
        tracing::info!(service = "newsblur", authenticated, "Login finished");
        authenticated
    }

    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let Some(reply) = self.get_json::<FeedsReply>("reader/feeds/").await else {
            return Vec::new();
        };
        let tags = feeds_to_tags(&reply.folders);

        let mut known = HashMap::new();
        let mut result = Vec::new();
        for (id, info) in reply.feeds {
            let title = info.feed_title.unwrap_or_else(|| {
                tracing::warn!(service = "newsblur", feed = %id, "Subscription has no title");
                id.clone()
            });
            let Some(link) = info.feed_link else {
                tracing::warn!(service = "newsblur", feed = %title, "Skipping a subscription without a link");
                continue;
            };

            let mut feed = TaggedFeedUrl::new(id.clone(), &title);
            for tag in tags.get(&id).into_iter().flatten() {
                feed.add_tag(tag.clone());
            }
            result.push(feed);
            known.insert(id, KnownFeed { title, link });
        }

        *self.known_feeds() = known;
        result
    }

    fn serves_content(&self) -> bool {
        true
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let known = self.known_feeds().get(feed_id).cloned().unwrap_or_default();
        let mut feed = RawFeed {
            title: known.title,
            link: known.link,
            ..RawFeed::empty(Dialect::NewsblurJson)
        };

        tracing::debug!(service = "newsblur", feed = %feed_id, pages = self.min_pages, "Fetching stories");
        for page in 1..=self.min_pages {
            let endpoint = format!("reader/feed/{}?page={}", feed_id, page);
            let Some(reply) = self.get_json::<StoriesReply>(&endpoint).await else {
                break;
            };
            feed.items.extend(
                reply
                    .stories
                    .into_iter()
                    .map(|story| story_to_item(feed_id, story)),
            );
        }

        feed.items
            .sort_by(|a, b| b.pub_date_ts.cmp(&a.pub_date_ts));
        feed
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool {
        self.post_ok("reader/mark_feed_as_read", &[("feed_id", feed_url)])
            .await
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        let Some((feed_id, story_id)) = guid.split_once(ID_SEPARATOR) else {
            return false;
        };
        let endpoint = if read {
            "reader/mark_story_as_read"
        } else {
            "reader/mark_story_as_unread"
        };
        self.post_ok(endpoint, &[("feed_id", feed_id), ("story_id", story_id)])
            .await
    }

    /// NewsBlur has no star or share support.
    async fn update_article_flags(&self, _old: &str, _new: &str, _guid: &str) -> bool {
        false
    }
}
