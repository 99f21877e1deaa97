//! Remote aggregation services.
//!
//! Every service is reached through one [`RemoteApi`] implementation. The
//! retrieval dispatcher only sees the trait; authentication state, wire
//! format and token lifecycle stay inside each adapter.
//!
//! | Service | Adapter |
//! |---|---|
//! | Tiny Tiny RSS | [`TtRssApi`] |
//! | NewsBlur | [`NewsBlurApi`] |
//! | Feedbin | [`FeedbinApi`] |
//! | FreshRSS, FeedHQ, Inoreader, The Old Reader | [`GReaderApi`] |
//! | ownCloud/Nextcloud News | [`OcNewsApi`] |
//! | Feedly | [`FeedlyApi`] |
//! | Miniflux | [`MinifluxApi`] |

pub mod credentials;
mod feedbin;
mod feedly;
mod greader;
mod miniflux;
mod newsblur;
mod ocnews;
pub mod tasks;
mod ttrss;

pub use credentials::Credentials;
pub use feedbin::FeedbinApi;
pub use feedly::FeedlyApi;
pub use greader::{GReaderApi, GReaderFlavor};
pub use miniflux::MinifluxApi;
pub use newsblur::NewsBlurApi;
pub use ocnews::OcNewsApi;
pub use tasks::BackgroundTasks;
pub use ttrss::TtRssApi;

use crate::config::{Config, UrlsSource};
use crate::feed::http::{client_builder, read_limited_bytes, FetchError, MAX_FEED_SIZE};
use crate::feed::model::RawFeed;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use std::sync::Arc;

// ============================================================================
// Contract
// ============================================================================

/// A feed identifier plus the tags (folders, categories) it carries.
///
/// The automatic `"~<title>"` tag is always present so a feed displays its
/// own name even without a folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedFeedUrl {
    pub url: String,
    pub tags: Vec<String>,
}

impl TaggedFeedUrl {
    pub fn new(url: impl Into<String>, title: &str) -> Self {
        Self {
            url: url.into(),
            tags: vec![format!("~{}", title)],
        }
    }

    /// Appends `tag` unless it is already present or empty.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !tag.is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.add_tag(tag);
        self
    }
}

/// Capabilities every remote service adapter provides.
///
/// None of the operations return errors: transport and payload failures are
/// logged inside the adapter and reported as `false` or an empty value.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    fn kind(&self) -> UrlsSource;

    /// Runs the service's login flow and keeps whatever later calls need.
    /// False when credentials are empty or rejected.
    async fn authenticate(&self) -> bool;

    /// Remote subscriptions with their `"~title"` and folder tags.
    async fn list_subscriptions(&self) -> Vec<TaggedFeedUrl>;

    /// Whether [`RemoteApi::fetch_feed`] serves article content; when false
    /// feeds are downloaded over plain HTTP with
    /// [`RemoteApi::inject_auth_headers`].
    fn serves_content(&self) -> bool {
        false
    }

    /// Turns a subscription URL into the identifier `fetch_feed` expects.
    /// `None` means the URL does not name a remote feed.
    fn feed_id<'a>(&self, feed_url: &'a str) -> Option<&'a str> {
        Some(feed_url)
    }

    /// Articles of one feed; every item is labelled `"<service>:unread"` or
    /// `"<service>:read"`.
    async fn fetch_feed(&self, _feed_id: &str) -> RawFeed {
        RawFeed::default()
    }

    async fn mark_all_read(&self, feed_url: &str) -> bool;

    async fn mark_article_read(&self, guid: &str, read: bool) -> bool;

    /// Marks several articles read. False if any of them failed.
    async fn mark_articles_read(&self, guids: &[String]) -> bool {
        let mut success = true;
        for guid in guids {
            if !self.mark_article_read(guid, true).await {
                success = false;
            }
        }
        success
    }

    /// Pushes star/share flag changes between `old_flags` and `new_flags`.
    ///
    /// Only flags whose presence changed cause a remote call. When both
    /// families change, the result is that of the last one; an earlier
    /// failure is only logged.
    async fn update_article_flags(&self, old_flags: &str, new_flags: &str, guid: &str) -> bool;

    /// Adds the service's authentication headers to an outgoing request.
    fn inject_auth_headers(&self, _headers: &mut HeaderMap) {}
}

/// Returns `Some(added)` when `flag` appears in exactly one of the two flag
/// strings, `None` when unset or unchanged.
pub fn flag_change(old_flags: &str, new_flags: &str, flag: Option<char>) -> Option<bool> {
    let flag = flag?;
    match (old_flags.contains(flag), new_flags.contains(flag)) {
        (false, true) => Some(true),
        (true, false) => Some(false),
        _ => None,
    }
}

/// `"<service>:unread"` or `"<service>:read"`.
pub fn read_state_label(kind: UrlsSource, unread: bool) -> String {
    format!("{}:{}", kind.name(), if unread { "unread" } else { "read" })
}

// ============================================================================
// Construction
// ============================================================================

/// Builds the adapter selected by `urls_source`, or `None` in local mode.
///
/// Credentials are resolved here; interactive prompting is the caller's job.
pub async fn build_api(
    config: &Config,
    tasks: BackgroundTasks,
) -> Result<Option<Arc<dyn RemoteApi>>, FetchError> {
    let source = config.urls_source;
    let Some(provider) = config.provider(source) else {
        return Ok(None);
    };
    let credentials = credentials::resolve(provider, source.name()).await;
    let client = client_builder(config)?.build()?;

    let api: Arc<dyn RemoteApi> = match source {
        UrlsSource::Local => return Ok(None),
        UrlsSource::Ttrss => Arc::new(TtRssApi::new(client, provider, credentials, tasks)),
        UrlsSource::Newsblur => Arc::new(NewsBlurApi::new(
            client_builder(config)?,
            provider,
            credentials,
            config.cookie_cache.clone(),
        )?),
        UrlsSource::Feedbin => Arc::new(FeedbinApi::new(client, provider, credentials)),
        UrlsSource::Freshrss => Arc::new(GReaderApi::new(
            GReaderFlavor::FreshRss,
            client,
            provider,
            credentials,
            tasks,
        )),
        UrlsSource::Feedhq => Arc::new(GReaderApi::new(
            GReaderFlavor::FeedHq,
            client,
            provider,
            credentials,
            tasks,
        )),
        UrlsSource::Inoreader => Arc::new(GReaderApi::new(
            GReaderFlavor::Inoreader,
            client,
            provider,
            credentials,
            tasks,
        )),
        UrlsSource::Oldreader => Arc::new(GReaderApi::new(
            GReaderFlavor::OldReader,
            client,
            provider,
            credentials,
            tasks,
        )),
        UrlsSource::Ocnews => Arc::new(OcNewsApi::new(client, provider, credentials)),
        UrlsSource::Feedly => Arc::new(FeedlyApi::new(client, provider, credentials)),
        UrlsSource::Miniflux => Arc::new(MinifluxApi::new(client, provider, credentials, tasks)),
    };

    tracing::debug!(service = %source, "Remote API initialized");
    Ok(Some(api))
}

/// Joins a base URL and a path with exactly one `/` between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Sends `request` and reads its body, logging and returning `None` on
/// transport failure. Non-2xx statuses are returned to the caller.
pub(crate) async fn send(
    service: UrlsSource,
    what: &str,
    request: RequestBuilder,
) -> Option<(StatusCode, Vec<u8>)> {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(service = %service, what = %what, error = %e, "Request failed");
            return None;
        }
    };
    let status = response.status();
    match read_limited_bytes(response, MAX_FEED_SIZE).await {
        Ok(body) => {
            tracing::trace!(service = %service, what = %what, status = %status, "Response received");
            Some((status, body))
        }
        Err(e) => {
            tracing::warn!(service = %service, what = %what, error = %e, "Failed to read response");
            None
        }
    }
}

/// Like [`send`] but only returns bodies of successful responses.
pub(crate) async fn send_ok(
    service: UrlsSource,
    what: &str,
    request: RequestBuilder,
) -> Option<Vec<u8>> {
    let (status, body) = send(service, what, request).await?;
    if status.is_success() {
        Some(body)
    } else {
        tracing::warn!(service = %service, what = %what, status = %status, "Unexpected HTTP status");
        None
    }
}

/// Deserializes a JSON body, logging and returning `None` on failure.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    service: UrlsSource,
    what: &str,
    body: &[u8],
) -> Option<T> {
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(service = %service, what = %what, error = %e, "Malformed response");
            None
        }
    }
}
