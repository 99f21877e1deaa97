//! Interfaces to the collaborators the retrieval core leans on: the
//! conditional-fetch cache, the article ignore list and the HTML-to-text
//! renderer. Each comes with a small default implementation.

use crate::config::Config;
use crate::feed::model::CanonicalItem;
use html_escape::decode_html_entities;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

// ============================================================================
// Conditional-fetch cache
// ============================================================================

/// HTTP validators remembered for one feed URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// `Last-Modified` as a unix timestamp; 0 when unknown.
    pub last_modified: i64,
    /// `ETag`, verbatim; empty when unknown.
    pub etag: String,
}

/// Storage for ETag/Last-Modified pairs.
///
/// Implementations are expected to be internally synchronized. Concurrent
/// refreshes of the same URL may lose an update; that only costs a full
/// download next time.
pub trait ValidatorCache: Send + Sync {
    fn fetch(&self, url: &str) -> Validators;

    /// Records changed validators. `last_modified == 0` and an empty `etag`
    /// mean "unchanged" and leave the stored value alone.
    fn update(&self, url: &str, last_modified: i64, etag: &str);
}

/// In-process [`ValidatorCache`].
#[derive(Debug, Default)]
pub struct MemoryValidatorCache {
    entries: Mutex<HashMap<String, Validators>>,
}

impl MemoryValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ValidatorCache for MemoryValidatorCache {
    fn fetch(&self, url: &str) -> Validators {
        match self.entries.lock() {
            Ok(entries) => entries.get(url).cloned().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().get(url).cloned().unwrap_or_default(),
        }
    }

    fn update(&self, url: &str, last_modified: i64, etag: &str) {
        if last_modified == 0 && etag.is_empty() {
            return;
        }
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = entries.entry(url.to_string()).or_default();
        if last_modified != 0 {
            entry.last_modified = last_modified;
        }
        if !etag.is_empty() {
            entry.etag = etag.to_string();
        }
    }
}

// ============================================================================
// Ignore list
// ============================================================================

/// Decides which articles are dropped and which feeds skip conditional GET.
pub trait Ignores: Send + Sync {
    /// True when the normalized item must not be stored.
    fn matches(&self, item: &CanonicalItem) -> bool;

    /// True when `url` must always be downloaded in full.
    fn matches_lastmodified(&self, url: &str) -> bool;
}

/// Ignores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIgnores;

impl Ignores for NoIgnores {
    fn matches(&self, _item: &CanonicalItem) -> bool {
        false
    }

    fn matches_lastmodified(&self, _url: &str) -> bool {
        false
    }
}

/// Ignore list built from the `ignore_article` and `always_download` settings.
#[derive(Debug, Clone, Default)]
pub struct ConfigIgnores {
    rules: Vec<(String, Regex)>,
    always_download: Vec<String>,
}

impl ConfigIgnores {
    /// Compiles the configured rules. Rules with an invalid title pattern are
    /// skipped with a warning.
    pub fn from_config(config: &Config) -> Self {
        let rules = config
            .ignore_article
            .iter()
            .filter_map(|rule| match Regex::new(&rule.title) {
                Ok(re) => Some((rule.feed.clone(), re)),
                Err(e) => {
                    tracing::warn!(
                        feed = %rule.feed,
                        pattern = %rule.title,
                        error = %e,
                        "Skipping ignore rule with invalid pattern"
                    );
                    None
                }
            })
            .collect();

        Self {
            rules,
            always_download: config.always_download.clone(),
        }
    }
}

impl Ignores for ConfigIgnores {
    fn matches(&self, item: &CanonicalItem) -> bool {
        self.rules
            .iter()
            .any(|(feed, re)| (feed == "*" || *feed == item.feed_url) && re.is_match(&item.title))
    }

    fn matches_lastmodified(&self, url: &str) -> bool {
        self.always_download.iter().any(|u| u == url)
    }
}

// ============================================================================
// HTML rendering
// ============================================================================

/// Turns HTML into plain text.
pub trait TextRenderer: Send + Sync {
    fn render(&self, html: &str, base_url: &str) -> String;
}

/// Tag-stripping renderer: block elements become line breaks, entities are
/// decoded, runs of whitespace inside a line collapse to one space.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextRenderer;

fn block_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<\s*(br|/?p|/?div|/?li|/?h[1-6]|/?tr|/?blockquote|hr)\b[^>]*>").ok()
    })
    .as_ref()
}

fn any_tag_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").ok()).as_ref()
}

/// Applies `re` when it compiled. The patterns are constants, so `None`
/// leaves the text as is rather than failing the render.
fn replace_all<'a>(re: Option<&Regex>, text: &'a str, with: &str) -> Cow<'a, str> {
    match re {
        Some(re) => re.replace_all(text, with),
        None => Cow::Borrowed(text),
    }
}

impl TextRenderer for PlainTextRenderer {
    fn render(&self, html: &str, _base_url: &str) -> String {
        let with_breaks = replace_all(block_tag_regex(), html, "\n");
        let stripped = replace_all(any_tag_regex(), &with_breaks, "");
        let decoded = decode_html_entities(&stripped);

        decoded
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
