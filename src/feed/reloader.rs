use crate::feed::dispatcher::{RetrieveError, Retriever};
use crate::feed::model::CanonicalFeed;
use crate::feed::normalizer::Normalizer;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a reload did to one feed.
#[derive(Debug)]
pub enum ReloadOutcome {
    Updated(CanonicalFeed),
    /// Nothing new (retries exhausted, 304, or a query feed); keep the old
    /// data.
    Unchanged,
    /// Fatal dispatch error, e.g. an unsupported URL.
    Failed(String),
}

/// Result of reloading a single feed.
#[derive(Debug)]
pub struct ReloadResult {
    pub url: String,
    pub outcome: ReloadOutcome,
}

/// Retrieves and normalizes many feeds concurrently.
pub struct Reloader {
    retriever: Arc<Retriever>,
    normalizer: Arc<Normalizer>,
    concurrency: usize,
}

impl Reloader {
    pub fn new(retriever: Arc<Retriever>, normalizer: Arc<Normalizer>, concurrency: usize) -> Self {
        Self {
            retriever,
            normalizer,
            concurrency: concurrency.max(1),
        }
    }

    /// Reloads every URL with at most `reload_threads` in flight.
    ///
    /// Results are returned in completion order, not input order. One feed
    /// failing never stops the others.
    pub async fn reload_all(&self, urls: Vec<String>) -> Vec<ReloadResult> {
        if urls.is_empty() {
            return Vec::new();
        }

        let total = urls.len();
        let completed = Arc::new(AtomicUsize::new(0));

        let results: Vec<ReloadResult> = stream::iter(urls)
            .map(|url| {
                let completed = completed.clone();
                async move {
                    let outcome = self.reload_one(&url).await;
                    let done = completed.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                    tracing::debug!(feed = %url, done, total, "Feed reloaded");
                    ReloadResult { url, outcome }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let failed = results
            .iter()
            .filter(|r| matches!(r.outcome, ReloadOutcome::Failed(_)))
            .count();
        tracing::info!(total, failed, "Reload finished");
        results
    }

    /// Reloads a single feed.
    pub async fn reload_one(&self, url: &str) -> ReloadOutcome {
        if url.starts_with("query:") {
            return ReloadOutcome::Unchanged;
        }

        match self.retriever.retrieve(url).await {
            Ok(raw) => ReloadOutcome::Updated(self.normalizer.normalize(raw, url).await),
            Err(RetrieveError::RetryExhausted {
                attempts,
                not_modified,
                ..
            }) => {
                tracing::info!(feed = %url, attempts, not_modified, "Keeping cached articles");
                ReloadOutcome::Unchanged
            }
            Err(e) => {
                tracing::warn!(feed = %url, error = %e, "Feed reload failed");
                ReloadOutcome::Failed(e.to_string())
            }
        }
    }
}
