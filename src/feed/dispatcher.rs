//! Retrieval dispatcher: picks a fetch strategy for a feed URL.
//!
//! | URL | Strategy |
//! |---|---|
//! | `query:...` | nothing is fetched; an empty feed is returned |
//! | `exec:<cmd>` | `sh -c <cmd>`, stdout parsed as a feed |
//! | `filter:<cmd>:<url>` | `<url>` downloaded, piped through `sh -c <cmd>` |
//! | `file://<path>` | local file parsed |
//! | `http://`, `https://` | conditional GET with retries |
//!
//! When a remote service is configured and serves content itself, every URL
//! is handed to [`RemoteApi::fetch_feed`] instead.

use crate::config::Config;
use crate::feed::collab::{Ignores, ValidatorCache, Validators};
use crate::feed::http::{self, conditional_get, ConditionalResponse, FetchError};
use crate::feed::model::{Dialect, RawFeed};
use crate::feed::parser::{parse_feed, ParseError};
use crate::remote::RemoteApi;
use reqwest::header::HeaderMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Why a feed could not be retrieved.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// The URL scheme is not one the dispatcher knows.
    #[error("Error: unsupported URL: {0}")]
    UnsupportedUrl(String),
    /// Every HTTP attempt failed or came back 304. Callers keep the data
    /// they already have.
    #[error("Giving up on {uri} after {attempts} attempt(s)")]
    RetryExhausted {
        uri: String,
        attempts: u32,
        /// At least one attempt was answered with `304 Not Modified`.
        not_modified: bool,
    },
    /// Local file or plugin process failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Plugin output or local file is not a feed.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The download feeding a filter plugin failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Fetches raw feeds for feed URLs.
pub struct Retriever {
    client: reqwest::Client,
    api: Option<Arc<dyn RemoteApi>>,
    cache: Arc<dyn ValidatorCache>,
    ignores: Arc<dyn Ignores>,
    retries: u32,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        config: &Config,
        client: reqwest::Client,
        cache: Arc<dyn ValidatorCache>,
        ignores: Arc<dyn Ignores>,
    ) -> Self {
        Self {
            client,
            api: None,
            cache,
            ignores,
            retries: config.download_retries.max(1),
            timeout: Duration::from_secs(config.download_timeout),
        }
    }

    /// Routes retrieval through `api` (provider mode).
    pub fn with_api(mut self, api: Option<Arc<dyn RemoteApi>>) -> Self {
        self.api = api;
        self
    }

    /// Retrieves `uri` with the strategy its scheme (or the configured remote
    /// service) selects.
    pub async fn retrieve(&self, uri: &str) -> Result<RawFeed, RetrieveError> {
        if uri.starts_with("query:") {
            tracing::trace!(feed = %uri, "Query feed, nothing to fetch");
            return Ok(RawFeed::default());
        }

        if let Some(api) = &self.api {
            if api.serves_content() {
                return Ok(self.fetch_remote(api.as_ref(), uri).await);
            }
            if is_http_url(uri) {
                let mut headers = HeaderMap::new();
                api.inject_auth_headers(&mut headers);
                return self.download_http(uri, &headers).await;
            }
        }

        if is_http_url(uri) {
            self.download_http(uri, &HeaderMap::new()).await
        } else if let Some(command) = uri.strip_prefix("exec:") {
            self.run_exec_plugin(command).await
        } else if let Some(rest) = uri.strip_prefix("filter:") {
            let (filter, url) = rest
                .split_once(':')
                .ok_or_else(|| RetrieveError::UnsupportedUrl(uri.to_string()))?;
            self.run_filter_plugin(filter, url).await
        } else if let Some(path) = uri.strip_prefix("file://") {
            let bytes = tokio::fs::read(path).await?;
            let feed = parse_feed(&bytes)?;
            tracing::debug!(path = %path, dialect = ?feed.dialect, "Parsed local feed file");
            Ok(feed)
        } else {
            Err(RetrieveError::UnsupportedUrl(uri.to_string()))
        }
    }

    async fn fetch_remote(&self, api: &dyn RemoteApi, uri: &str) -> RawFeed {
        let Some(feed_id) = api.feed_id(uri) else {
            tracing::debug!(service = %api.kind(), feed = %uri, "URL names no remote feed");
            return RawFeed::default();
        };
        let feed = api.fetch_feed(feed_id).await;
        tracing::debug!(
            service = %api.kind(),
            feed = %uri,
            items = feed.items.len(),
            "Fetched remote feed"
        );
        feed
    }

    /// Downloads and parses `uri`, retrying while nothing usable came back.
    ///
    /// Transport and parse failures are logged and count as a failed attempt,
    /// as does `304 Not Modified`.
    async fn download_http(
        &self,
        uri: &str,
        extra_headers: &HeaderMap,
    ) -> Result<RawFeed, RetrieveError> {
        let mut not_modified = false;

        for attempt in 1..=self.retries {
            let validators = if self.ignores.matches_lastmodified(uri) {
                Validators::default()
            } else {
                self.cache.fetch(uri)
            };

            match conditional_get(&self.client, uri, &validators, extra_headers, self.timeout).await
            {
                Ok(ConditionalResponse::Fetched(download)) => {
                    self.record_validators(uri, &validators, download.last_modified, &download.etag);
                    match parse_feed(&download.bytes) {
                        Ok(feed) if feed.dialect != Dialect::Unknown => {
                            tracing::debug!(feed = %uri, attempt, dialect = ?feed.dialect, "Feed downloaded");
                            return Ok(feed);
                        }
                        Ok(_) => {
                            tracing::warn!(feed = %uri, attempt, "Downloaded document is not a feed");
                        }
                        Err(e) => {
                            tracing::warn!(feed = %uri, attempt, error = %e, "Failed to parse feed");
                        }
                    }
                }
                Ok(ConditionalResponse::NotModified {
                    last_modified,
                    etag,
                }) => {
                    self.record_validators(uri, &validators, last_modified, &etag);
                    not_modified = true;
                    tracing::debug!(feed = %uri, attempt, "Feed not modified");
                }
                Err(e) => {
                    tracing::warn!(feed = %uri, attempt, error = %e, "Feed download failed");
                }
            }
        }

        Err(RetrieveError::RetryExhausted {
            uri: uri.to_string(),
            attempts: self.retries,
            not_modified,
        })
    }

    /// Stores whichever of the response validators differ from the ones sent.
    fn record_validators(&self, uri: &str, sent: &Validators, last_modified: i64, etag: &str) {
        if last_modified == 0 && etag.is_empty() {
            return;
        }
        tracing::trace!(
            feed = %uri,
            old_last_modified = sent.last_modified,
            new_last_modified = last_modified,
            old_etag = %sent.etag,
            new_etag = %etag,
            "Updating validators"
        );
        self.cache.update(
            uri,
            if last_modified != sent.last_modified {
                last_modified
            } else {
                0
            },
            if etag != sent.etag { etag } else { "" },
        );
    }

    async fn run_exec_plugin(&self, command: &str) -> Result<RawFeed, RetrieveError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await?;
        if !output.status.success() {
            tracing::warn!(command = %command, status = %output.status, "Exec plugin exited with failure");
        }

        let feed = parse_feed(&output.stdout)?;
        tracing::debug!(command = %command, dialect = ?feed.dialect, "Parsed exec plugin output");
        Ok(feed)
    }

    async fn run_filter_plugin(&self, filter: &str, url: &str) -> Result<RawFeed, RetrieveError> {
        let download = http::get(&self.client, url, &HeaderMap::new(), self.timeout).await?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(filter)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        // Feed stdin from a separate task so a filter that writes before it
        // has read everything cannot deadlock against us.
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = download.bytes;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::debug!(error = %e, "Filter plugin closed stdin early");
                }
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            tracing::warn!(filter = %filter, status = %output.status, "Filter plugin exited with failure");
        }
        tracing::trace!(
            filter = %filter,
            output = %String::from_utf8_lossy(&output.stdout),
            "Filter plugin output"
        );

        let feed = parse_feed(&output.stdout)?;
        tracing::debug!(filter = %filter, url = %url, dialect = ?feed.dialect, "Parsed filter plugin output");
        Ok(feed)
    }
}

fn is_http_url(uri: &str) -> bool {
    uri.starts_with("http://") || uri.starts_with("https://")
}
