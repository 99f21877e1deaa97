//! Google Reader protocol services: FreshRSS, FeedHQ, Inoreader and
//! The Old Reader.
//!
//! All four log in through `accounts/ClientLogin` and send
//! `Authorization: GoogleLogin auth=<token>` afterwards. FreshRSS and FeedHQ
//! serve article content as `stream/contents` JSON; Inoreader and The Old
//! Reader subscriptions point at Atom streams that the HTTP branch downloads
//! with [`RemoteApi::inject_auth_headers`].

use super::{
    flag_change, join_url, parse_json, read_state_label, send_ok, BackgroundTasks, Credentials,
    RemoteApi, TaggedFeedUrl,
};
use crate::config::{ProviderConfig, UrlsSource};
use crate::feed::model::{Dialect, RawFeed, RawItem};
use crate::util::format_timestamp;
use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::{Arc, RwLock};

const LOGIN_PATH: &str = "accounts/ClientLogin";
const API_PREFIX: &str = "reader/api/0/";
const STREAM_PREFIX: &str = "reader/api/0/stream/contents/";
const ATOM_PREFIX: &str = "reader/atom/";

const STATE_READ: &str = "user/-/state/com.google/read";
const STATE_KEPT_UNREAD: &str = "user/-/state/com.google/kept-unread";
const STATE_TRACKING_KEPT_UNREAD: &str = "user/-/state/com.google/tracking-kept-unread";
const STATE_STARRED: &str = "user/-/state/com.google/starred";
const STATE_BROADCAST: &str = "user/-/state/com.google/broadcast";

/// Subscriptions with this id prefix are ads that never load.
const SPONSORED_PREFIX: &str = "tor/sponsored/";

/// Which Google Reader service an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GReaderFlavor {
    FreshRss,
    FeedHq,
    Inoreader,
    OldReader,
}

impl GReaderFlavor {
    pub fn kind(self) -> UrlsSource {
        match self {
            GReaderFlavor::FreshRss => UrlsSource::Freshrss,
            GReaderFlavor::FeedHq => UrlsSource::Feedhq,
            GReaderFlavor::Inoreader => UrlsSource::Inoreader,
            GReaderFlavor::OldReader => UrlsSource::Oldreader,
        }
    }

    /// Service root used when the configuration leaves `url` empty.
    fn default_url(self) -> &'static str {
        match self {
            GReaderFlavor::FreshRss => "",
            GReaderFlavor::FeedHq => "https://feedhq.org/",
            GReaderFlavor::Inoreader => "https://inoreader.com/",
            GReaderFlavor::OldReader => "https://theoldreader.com/",
        }
    }

    fn serves_content(self) -> bool {
        matches!(self, GReaderFlavor::FreshRss | GReaderFlavor::FeedHq)
    }

    /// Whether mutations need a fresh `T=` edit token.
    fn uses_edit_token(self) -> bool {
        !matches!(self, GReaderFlavor::Inoreader)
    }

    fn feed_prefix(self) -> &'static str {
        if self.serves_content() {
            STREAM_PREFIX
        } else {
            ATOM_PREFIX
        }
    }
}

struct Inner {
    flavor: GReaderFlavor,
    client: reqwest::Client,
    base: String,
    credentials: Credentials,
    min_items: u32,
    star_flag: Option<char>,
    share_flag: Option<char>,
    app_id: Option<String>,
    app_key: Option<String>,
    auth: RwLock<Option<SecretString>>,
    tasks: BackgroundTasks,
}

#[derive(Clone)]
pub struct GReaderApi {
    inner: Arc<Inner>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionList {
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
struct Category {
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Stream {
    #[serde(default)]
    title: String,
    #[serde(default)]
    items: Vec<StreamItem>,
}

#[derive(Debug, Deserialize)]
struct StreamItem {
    id: String,
    title: Option<String>,
    author: Option<String>,
    #[serde(default)]
    published: i64,
    #[serde(default)]
    canonical: Vec<Href>,
    #[serde(default)]
    alternate: Vec<Href>,
    summary: Option<Body>,
    content: Option<Body>,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Href {
    href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Body {
    #[serde(default)]
    content: String,
}

impl GReaderApi {
    pub fn new(
        flavor: GReaderFlavor,
        client: reqwest::Client,
        provider: &ProviderConfig,
        credentials: Credentials,
        tasks: BackgroundTasks,
    ) -> Self {
        let base = if provider.url.is_empty() {
            flavor.default_url().to_string()
        } else {
            provider.url.clone()
        };
        if base.is_empty() {
            tracing::error!(service = %flavor.kind(), "No server URL configured");
        }
        Self {
            inner: Arc::new(Inner {
                flavor,
                client,
                base,
                credentials,
                min_items: provider.min_items,
                star_flag: provider.star_flag(),
                share_flag: provider.share_flag(),
                app_id: provider.app_id.clone(),
                app_key: provider.app_key.clone(),
                auth: RwLock::new(None),
                tasks,
            }),
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.inner.base, path)
    }

    fn api_url(&self, endpoint: &str) -> String {
        self.url(&format!("{}{}", API_PREFIX, endpoint))
    }

    fn auth_token(&self) -> Option<SecretString> {
        match self.inner.auth.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_auth_token(&self, token: Option<SecretString>) {
        match self.inner.auth.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    /// Inoreader's static application headers.
    fn app_headers(&self, headers: &mut HeaderMap) {
        if self.inner.flavor != GReaderFlavor::Inoreader {
            return;
        }
        let pairs = [
            ("appid", self.inner.app_id.as_deref()),
            ("appkey", self.inner.app_key.as_deref()),
        ];
        for (name, value) in pairs {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.inject_auth_headers(&mut headers);
        headers
    }

    async fn client_login(&self) -> Option<SecretString> {
        let credentials = &self.inner.credentials;
        let source = format!("feedsync/{}", env!("CARGO_PKG_VERSION"));
        let mut form = vec![
            ("Email", credentials.user.clone()),
            ("Passwd", credentials.pass.expose_secret().to_string()),
        ];
        if self.inner.flavor != GReaderFlavor::Inoreader {
            form.extend([
                ("service", "reader".to_string()),
                ("source", source),
                ("accountType", "HOSTED_OR_GOOGLE".to_string()),
                ("continue", "http://www.google.com/".to_string()),
            ]);
        }

        let mut headers = HeaderMap::new();
        self.app_headers(&mut headers);
        let request = self
            .inner
            .client
            .post(self.url(LOGIN_PATH))
            .headers(headers)
            .form(&form);
        let body = send_ok(self.kind(), LOGIN_PATH, request).await?;

        String::from_utf8_lossy(&body)
            .lines()
            .find_map(|line| line.strip_prefix("Auth="))
            .map(|token| SecretString::from(token.to_string()))
    }

    /// Fetches a short-lived edit token; empty on failure.
    async fn edit_token(&self) -> String {
        let request = self
            .inner
            .client
            .get(self.api_url("token"))
            .headers(self.headers());
        send_ok(self.kind(), "token", request)
            .await
            .map(|body| String::from_utf8_lossy(&body).trim().to_string())
            .unwrap_or_default()
    }

    /// POSTs a form to an API endpoint, adding an edit token where the
    /// service wants one. True when the service replied `OK`.
    async fn post_form(&self, endpoint: &str, mut form: Vec<(&str, String)>) -> bool {
        if self.inner.flavor.uses_edit_token() {
            form.push(("T", self.edit_token().await));
        }
        let request = self
            .inner
            .client
            .post(self.api_url(endpoint))
            .headers(self.headers())
            .form(&form);
        let Some(body) = send_ok(self.kind(), endpoint, request).await else {
            return false;
        };
        let ok = String::from_utf8_lossy(&body).trim() == "OK";
        if !ok {
            tracing::warn!(service = %self.kind(), endpoint = %endpoint, "Service did not confirm update");
        }
        ok
    }

    async fn edit_tag(&self, guid: &str, add: &[&str], remove: &[&str]) -> bool {
        let mut form = vec![("i", guid.to_string())];
        form.extend(add.iter().map(|tag| ("a", tag.to_string())));
        form.extend(remove.iter().map(|tag| ("r", tag.to_string())));
        if self.inner.flavor.uses_edit_token() {
            form.push(("ac", "edit".to_string()));
        }
        self.post_form("edit-tag", form).await
    }

    async fn set_read(&self, guid: &str, read: bool) -> bool {
        match (self.inner.flavor, read) {
            (GReaderFlavor::Inoreader, true) => self.edit_tag(guid, &[STATE_READ], &[]).await,
            (GReaderFlavor::Inoreader, false) => self.edit_tag(guid, &[], &[STATE_READ]).await,
            (_, true) => {
                self.edit_tag(guid, &[STATE_READ], &[STATE_KEPT_UNREAD])
                    .await
            }
            (_, false) => {
                self.edit_tag(
                    guid,
                    &[STATE_KEPT_UNREAD, STATE_TRACKING_KEPT_UNREAD],
                    &[STATE_READ],
                )
                .await
            }
        }
    }

    async fn toggle_state(&self, guid: &str, state: &str, on: bool) -> bool {
        if on {
            self.edit_tag(guid, &[state], &[]).await
        } else {
            self.edit_tag(guid, &[], &[state]).await
        }
    }

    /// Stream id encoded in one of this adapter's subscription URLs.
    fn stream_id(&self, feed_url: &str) -> Option<String> {
        let prefix = self.url(self.inner.flavor.feed_prefix());
        let rest = feed_url.strip_prefix(&prefix)?;
        let id = rest.split('?').next().unwrap_or(rest);
        match percent_decode_str(id).decode_utf8() {
            Ok(id) => Some(id.into_owned()),
            Err(e) => {
                tracing::debug!(service = %self.kind(), feed = %feed_url, error = %e, "Undecodable stream id");
                None
            }
        }
    }

    fn subscription_url(&self, id: &str) -> String {
        let id = if self.inner.flavor.serves_content() {
            utf8_percent_encode(id, NON_ALPHANUMERIC).to_string()
        } else {
            id.to_string()
        };
        format!(
            "{}{}?n={}",
            self.url(self.inner.flavor.feed_prefix()),
            id,
            self.inner.min_items
        )
    }
}

fn stream_item_to_raw(kind: UrlsSource, item: StreamItem) -> RawItem {
    let unread = !item.categories.iter().any(|c| c == STATE_READ);
    let link = item
        .canonical
        .into_iter()
        .chain(item.alternate)
        .find_map(|h| h.href)
        .unwrap_or_default();
    let content = item
        .content
        .or(item.summary)
        .map(|b| b.content)
        .unwrap_or_default();

    let mut raw = RawItem {
        guid: item.id,
        title: item.title.unwrap_or_default(),
        author: item.author.unwrap_or_default(),
        link,
        content_encoded: content,
        pub_date: format_timestamp(item.published),
        pub_date_ts: Some(item.published),
        ..RawItem::default()
    };
    raw.labels.insert(read_state_label(kind, unread));
    raw
}

#[async_trait]
impl RemoteApi for GReaderApi {
    fn kind(&self) -> UrlsSource {
        self.inner.flavor.kind()
    }

    async fn authenticate(&self) -> bool {
        if self.inner.credentials.is_empty() {
            tracing::warn!(service = %self.kind(), "No credentials configured");
            return false;
        }
        let token = self.client_login().await;
        let ok = token.is_some();
        self.set_auth_token(token);
        if !ok {
            tracing::warn!(service = %self.kind(), "ClientLogin failed");
        }
        ok
    }

    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl> {
        let request = self
            .inner
            .client
            .get(self.api_url("subscription/list?output=json"))
            .headers(self.headers());
        let Some(body) = send_ok(self.kind(), "subscription/list", request).await else {
            return Vec::new();
        };
        let Some(list) = parse_json::<SubscriptionList>(self.kind(), "subscription/list", &body)
        else {
            return Vec::new();
        };

        let mut feeds = Vec::new();
        for (index, sub) in list.subscriptions.into_iter().enumerate() {
            let Some(id) = sub.id else {
                tracing::warn!(service = %self.kind(), "Skipping a subscription without an id");
                continue;
            };
            if id.starts_with(SPONSORED_PREFIX) {
                continue;
            }
            let title = sub.title.unwrap_or_else(|| {
                tracing::warn!(service = %self.kind(), index, "Subscription has no title");
                index.to_string()
            });

            let mut feed = TaggedFeedUrl::new(self.subscription_url(&id), &title);
            for label in sub.categories.into_iter().filter_map(|c| c.label) {
                feed.add_tag(label);
            }
            feeds.push(feed);
        }
        feeds
    }

    fn serves_content(&self) -> bool {
        self.inner.flavor.serves_content()
    }

    async fn fetch_feed(&self, feed_id: &str) -> RawFeed {
        let mut feed = RawFeed::empty(Dialect::FreshrssJson);
        let request = self.inner.client.get(feed_id).headers(self.headers());
        let Some(body) = send_ok(self.kind(), "stream/contents", request).await else {
            return feed;
        };
        let Some(stream) = parse_json::<Stream>(self.kind(), "stream/contents", &body) else {
            return feed;
        };

        feed.title = stream.title;
        feed.items = stream
            .items
            .into_iter()
            .map(|item| stream_item_to_raw(self.kind(), item))
            .collect();
        feed.items
            .sort_by(|a, b| b.pub_date_ts.cmp(&a.pub_date_ts));
        feed
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool {
        let Some(stream) = self.stream_id(feed_url) else {
            tracing::warn!(service = %self.kind(), feed = %feed_url, "Not a subscription URL");
            return false;
        };
        self.post_form("mark-all-as-read", vec![("s", stream)]).await
    }

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool {
        if self.inner.flavor == GReaderFlavor::Inoreader {
            let api = self.clone();
            let guid = guid.to_string();
            self.inner.tasks.spawn(async move {
                api.set_read(&guid, read).await;
            });
            return true;
        }
        self.set_read(guid, read).await
    }

    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool {
        let mut success = true;
        if let Some(star) = flag_change(old_flags, new_flags, self.inner.star_flag) {
            success = self.toggle_state(guid, STATE_STARRED, star).await;
        }
        if let Some(share) = flag_change(old_flags, new_flags, self.inner.share_flag) {
            success = self.toggle_state(guid, STATE_BROADCAST, share).await;
        }
        success
    }

    fn inject_auth_headers(&self, headers: &mut HeaderMap) {
        if let Some(token) = self.auth_token() {
            let value = format!("GoogleLogin auth={}", token.expose_secret());
            if let Ok(mut value) = HeaderValue::from_str(&value) {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
        }
        self.app_headers(headers);
    }
}
