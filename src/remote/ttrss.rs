//! Tiny Tiny RSS JSON API (`POST <url>/api/`).

use super::{
    flag_change, join_url, parse_json, read_state_label, send_ok, BackgroundTasks, Credentials,
    RemoteApi, TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::model::{Dialect, RawEnclosure, RawFeed, RawItem};
use crate::util::format_timestamp;
use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const NOT_LOGGED_IN: &str = "NOT_LOGGED_IN";

/// Category id that makes `getFeeds` return every feed in one call.
const ALL_FEEDS_CATEGORY: &str = "-3";

/// Article fields addressed by `updateArticle`.
const FIELD_STARRED: u8 = 0;
const FIELD_PUBLISHED: u8 = 1;
const FIELD_UNREAD: u8 = 2;

#[derive(Debug, Default)]
struct Session {
    sid: String,
    api_level: Option<i64>,
}

struct Inner {
    client: reqwest::Client,
    endpoint: String,
    credentials: Credentials,
    /// Single-user mode: log in as `admin` and send HTTP basic auth.
    single: bool,
    star_flag: Option<char>,
    share_flag: Option<char>,
    session: Mutex<Session>,
    tasks: BackgroundTasks,
}

#[derive(Clone)]
pub struct TtRssApi {
    inner: Arc<Inner>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    status: i64,
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Headline {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    attachments: Option<Vec<Attachment>>,
    #[serde(default)]
    unread: bool,
    #[serde(default)]
    updated: i64,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    content_url: Option<String>,
    content_type: Option<String>,
}

impl TtRssApi {
    pub fn new(
        client: reqwest::Client,
        provider: &ProviderConfig,
        credentials: Credentials,
        tasks: BackgroundTasks,
    ) -> Self {
        let single = provider.mode == "single";
        Self {
            inner: Arc::new(Inner {
                client,
                endpoint: join_url(&provider.url, "api/"),
                credentials,
                single,
                star_flag: provider.star_flag(),
                share_flag: provider.share_flag(),
                session: Mutex::new(Session::default()),
                tasks,
            }),
        }
    }

    fn login_user(&self) -> &str {
        if self.inner.single {
            "admin"
        } else {
            &self.inner.credentials.user
        }
    }

    async fn current_sid(&self) -> String {
        self.inner.session.lock().await.sid.clone()
    }

    /// Logs in again unless another caller already replaced `stale`.
    async fn refresh_session(&self, stale: &str) -> bool {
        let mut session = self.inner.session.lock().await;
        if !session.sid.is_empty() && session.sid != stale {
            return true;
        }

        let (sid, api_level) = self.retrieve_sid().await;
        session.sid = sid;
        if api_level.is_some() {
            session.api_level = api_level;
        }
        !session.sid.is_empty()
    }

    async fn retrieve_sid(&self) -> (String, Option<i64>) {
        let args = [
            ("user", self.login_user().to_string()),
            (
                "password",
                self.inner.credentials.pass.expose_secret().to_string(),
            ),
        ];
        let Some(content) = self.call("login", &args, "").await.and_then(Result::ok) else {
            tracing::warn!(service = "ttrss", "Login failed");
            return (String::new(), None);
        };

        let sid = content
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let api_level = content.get("api_level").and_then(Value::as_i64);
        tracing::debug!(service = "ttrss", api_level = ?api_level, "Logged in");
        (sid, api_level)
    }

    /// One HTTP round trip. `Ok(content)` on status 0, `Err(content)` on an
    /// API error, `None` on transport or payload failure.
    async fn call(
        &self,
        op: &str,
        args: &[(&str, String)],
        sid: &str,
    ) -> Option<Result<Value, Value>> {
        let mut body = Map::new();
        body.insert("op".to_string(), Value::from(op));
        if !sid.is_empty() {
            body.insert("sid".to_string(), Value::from(sid));
        }
        for (key, value) in args {
            body.insert((*key).to_string(), Value::from(value.as_str()));
        }

        let mut request = self.inner.client.post(&self.inner.endpoint).json(&body);
        if self.inner.single {
            request = request.basic_auth(
                &self.inner.credentials.user,
                Some(self.inner.credentials.pass.expose_secret()),
            );
        }

        let bytes = send_ok(UrlsSource::Ttrss, op, request).await?;
        let reply: Reply = parse_json(UrlsSource::Ttrss, op, &bytes)?;
        let Some(content) = reply.content else {
            tracing::warn!(service = "ttrss", op = %op, "Reply without content");
            return None;
        };
        if reply.status == 0 {
            Some(Ok(content))
        } else {
            Some(Err(content))
        }
    }

    /// Runs an API operation, logging in again once if the session expired.
    async fn run_op(&self, op: &str, args: &[(&str, String)]) -> Option<Value> {
        let mut relogged = false;
        loop {
            let sid = self.current_sid().await;
            match self.call(op, args, &sid).await? {
                Ok(content) => return Some(content),
                Err(content) => {
                    let error = content
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if error == NOT_LOGGED_IN && !relogged {
                        relogged = true;
                        if !self.refresh_session(&sid).await {
                            return None;
                        }
                        continue;
                    }
                    tracing::warn!(service = "ttrss", op = %op, error = %error, "API error");
                    return None;
                }
            }
        }
    }

    async fn api_level(&self) -> i64 {
        if let Some(level) = self.inner.session.lock().await.api_level {
            return level;
        }
        let level = self
            .run_op("getApiLevel", &[])
            .await
            .and_then(|content| content.get("level").and_then(Value::as_i64))
            .unwrap_or(0);
        self.inner.session.lock().await.api_level = Some(level);
        level
    }

    async fn update_article(&self, guid: &str, field: u8, mode: u8) -> bool {
        let args = [
            ("article_ids", guid.to_string()),
            ("field", field.to_string()),
            ("mode", mode.to_string()),
        ];
        self.run_op("updateArticle", &args).await.is_some()
    }

    async fn feeds_in_category(&self, cat_id: &str) -> Option<Vec<Value>> {
        let content = self
            .run_op("getFeeds", &[("cat_id", cat_id.to_string())])
            .await?;
        match content {
            Value::Array(feeds) => Some(feeds),
            _ => None,
        }
    }
}

/// Category ids arrive as numbers or numeric strings depending on the
/// server version.
fn category_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn feed_from_json(feed: &Value, category: Option<&str>) -> Option<TaggedFeedUrl> {
    let id = feed.get("id").and_then(Value::as_i64)?;
    let title = feed.get("title").and_then(Value::as_str).unwrap_or_default();
    let feed_url = feed.get("feed_url").and_then(Value::as_str)?;

    let mut tagged = TaggedFeedUrl::new(format!("{}#{}", feed_url, id), title);
    if let Some(category) = category {
        tagged.add_tag(category);
    }
    Some(tagged)
}

fn headline_to_item(headline: Headline) -> RawItem {
    let enclosures = headline
        .attachments
        .unwrap_or_default()
        .into_iter()
        .find_map(|a| match (a.content_url, a.content_type) {
            (Some(url), Some(mime_type)) => Some(RawEnclosure {
                url,
                mime_type,
                ..RawEnclosure::default()
            }),
            _ => None,
        })
        .into_iter()
        .collect();

    let mut item = RawItem {
        title: headline.title.unwrap_or_default(),
        link: headline.link.unwrap_or_default(),
        author: headline.author.unwrap_or_default(),
        content_encoded: headline.content.unwrap_or_default(),
        guid: headline.id.to_string(),
        pub_date: format_timestamp(headline.updated),
        pub_date_ts: Some(headline.updated),
        enclosures,
        ..RawItem::default()
    };
    item.labels
        .insert(read_state_label(UrlsSource::Ttrss, headline.unread));
    item
}

#[async_trait]
impl RemoteApi for TtRssApi {
    fn kind(&self) -> UrlsSource {
        UrlsSource::Ttrss
    }

    async fn authenticate(&self) -> bool {
        if self.inner.credentials.is_empty() {
            tracing::warn!(service = "ttrss", "No credentials configured");
            return false;
        }
        self.inner.session.lock().await.sid.clear();
        self.refresh_session("").await
    }

    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let categories = match self.run_op("getCategories", &[]).await {
            Some(Value::Array(categories)) => categories,
            _ => Vec::new(),
        };

        let mut feeds = Vec::new();
        if self.api_level().await >= 2 {
            let names: HashMap<i64, &str> = categories
                .iter()
                .filter_map(|cat| {
                    let id = cat.get("id").and_then(category_id)?;
                    let title = cat.get("title").and_then(Value::as_str)?;
                    Some((id, title))
                })
                .collect();

            let Some(all) = self.feeds_in_category(ALL_FEEDS_CATEGORY).await else {
                tracing::warn!(service = "ttrss", "Failed to list feeds");
                return feeds;
            };
            for feed in &all {
                let category = feed
                    .get("cat_id")
                    .and_then(category_id)
                    .filter(|id| *id > 0)
                    .and_then(|id| names.get(&id).copied());
                feeds.extend(feed_from_json(feed, category));
            }
        } else {
            for cat in &categories {
                let Some(id) = cat.get("id").and_then(category_id) else {
                    continue;
                };
                if id < 0 {
                    continue;
                }
                let title = cat.get("title").and_then(Value::as_str);
                let Some(in_category) = self.feeds_in_category(&id.to_string()).await else {
                    continue;
                };
                for feed in &in_category {
                    feeds.extend(feed_from_json(feed, title));
                }
            }
        }

        tracing::debug!(service = "ttrss", count = feeds.len(), "Listed subscriptions");
        feeds
    }

    fn serves_content(&self) -> bool {
        true
    }

    fn feed_id<'a>(&self, feed_url: &'a str) -> Option<&'a str> {
        feed_url.split_once('#').map(|(_, id)| id)
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let args = [
            ("feed_id", feed_id.to_string()),
            ("show_content", "1".to_string()),
            ("include_attachments", "1".to_string()),
        ];
        let mut feed = RawFeed::empty(Dialect::TtrssJson);

        let Some(content) = self.run_op("getHeadlines", &args).await else {
            return feed;
        };
        let Ok(headlines) = serde_json::from_value::<Vec<Headline>>(content) else {
            tracing::warn!(service = "ttrss", feed = %feed_id, "Malformed headlines");
            return feed;
        };

        feed.items = headlines.into_iter().map(headline_to_item).collect();
        feed.items
            .sort_by(|a, b| b.pub_date_ts.cmp(&a.pub_date_ts));
        feed
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool {
        let Some(id) = self.feed_id(feed_url) else {
            return false;
        };
        self.run_op("catchupFeed", &[("feed_id", id.to_string())])
            .await
            .is_some()
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        let api = self.clone();
        let guid = guid.to_string();
        self.inner.tasks.spawn(async move {
            api.update_article(&guid, FIELD_UNREAD, if read { 0 } else { 1 })
                .await;
        });
        true
    }

    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool {
        let mut success = true;
        if let Some(starred) = flag_change(old_flags, new_flags, self.inner.star_flag) {
            success = self.update_article(guid, FIELD_STARRED, starred as u8).await;
        }
        if let Some(published) = flag_change(old_flags, new_flags, self.inner.share_flag) {
            success = self
                .update_article(guid, FIELD_PUBLISHED, published as u8)
                .await;
        }
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer, tasks: BackgroundTasks) -> TtRssApi {
        let provider = ProviderConfig {
            url: server.uri(),
            flag_star: "s".to_string(),
            flag_share: "p".to_string(),
            ..ProviderConfig::default()
        };
        TtRssApi::new(
            reqwest::Client::new(),
            &provider,
            Credentials::new("alice", "pw"),
            tasks,
        )
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/"))
            .and(body_partial_json(json!({"op": "login", "user": "alice"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "content": {"session_id": "sid-1", "api_level": 14}
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_expired_session_relogs_once() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"op": "getHeadlines", "sid": "sid-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "content": [
                    {"id": 1, "title": "old", "unread": false, "updated": 100},
                    {"id": 2, "title": "new", "unread": true, "updated": 200,
                     "attachments": [{"content_url": "http://x/a.mp3", "content_type": "audio/mpeg"}]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"op": "getHeadlines"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 1,
                "content": {"error": "NOT_LOGGED_IN"}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let api = api(&server, BackgroundTasks::new());
        let feed = api.fetch_feed("7").await;

        assert_eq!(feed.dialect, Dialect::TtrssJson);
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].guid, "2");
        assert!(feed.items[0].labels.contains("ttrss:unread"));
        assert_eq!(feed.items[0].enclosures[0].mime_type, "audio/mpeg");
        assert!(feed.items[1].labels.contains("ttrss:read"));
    }

    #[tokio::test]
    async fn test_list_subscriptions_bulk_with_categories() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"op": "getCategories"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "content": [{"id": "3", "title": "Tech"}, {"id": -1, "title": "Special"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"op": "getFeeds", "cat_id": "-3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "content": [
                    {"id": 5, "title": "LWN", "feed_url": "https://lwn.net/rss", "cat_id": 3},
                    {"id": 6, "title": "Loose", "feed_url": "https://x/feed", "cat_id": 0}
                ]
            })))
            .mount(&server)
            .await;

        let api = api(&server, BackgroundTasks::new());
        assert!(api.authenticate().await);
        let feeds = api.list_subscriptions().await;

        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].url, "https://lwn.net/rss#5");
        assert_eq!(feeds[0].tags, vec!["~LWN".to_string(), "Tech".to_string()]);
        assert_eq!(feeds[1].tags, vec!["~Loose".to_string()]);
        assert_eq!(api.feed_id(&feeds[0].url), Some("5"));
    }

    #[tokio::test]
    async fn test_mark_article_read_runs_in_background() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "op": "updateArticle", "article_ids": "42", "field": "2", "mode": "0"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "content": {"status": "OK", "updated": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tasks = BackgroundTasks::new();
        let api = api(&server, tasks.clone());
        assert!(api.authenticate().await);
        assert!(api.mark_article_read("42", true).await);
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_article_flags_only_changed_families() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"op": "updateArticle", "field": "0", "mode": "1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": 0,
                "content": {"status": "OK"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"op": "updateArticle", "field": "1"})))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let api = api(&server, BackgroundTasks::new());
        assert!(api.authenticate().await);
        assert!(api.update_article_flags("p", "ps", "42").await);
        assert!(api.update_article_flags("ps", "ps", "42").await);
    }

    #[test]
    fn test_feed_id_requires_fragment() {
        let api = TtRssApi::new(
            reqwest::Client::new(),
            &ProviderConfig::default(),
            Credentials::empty(),
            BackgroundTasks::new(),
        );
        assert_eq!(api.feed_id("https://x/feed#12"), Some("12"));
        assert_eq!(api.feed_id("https://x/feed"), None);
        // Everything after the first '#' is the id
        assert_eq!(api.feed_id("https://x/feed#page#12"), Some("page#12"));
    }
}
