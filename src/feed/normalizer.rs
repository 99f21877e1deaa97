//! Turns a [`RawFeed`] of any dialect into a [`CanonicalFeed`].

use crate::config::Config;
use crate::feed::collab::{Ignores, TextRenderer};
use crate::feed::http;
use crate::feed::model::{
    CanonicalFeed, CanonicalItem, Enclosure, RawEnclosure, RawFeed, RawItem,
};
use crate::util::{
    absolute_url, first_line, format_rfc822, format_timestamp, make_title, parse_date,
    single_line,
};
use chrono::Utc;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

/// Language prefixes rendered right-to-left.
const RTL_LANGUAGES: [&str; 8] = ["ar", "fa", "ur", "ps", "syr", "dv", "he", "yi"];

const DEFAULT_MIME: &str = "text/html";
const FULL_PAGE_FALLBACK_MIME: &str = "application/octet-stream";

const UNREAD_LABELS: [&str; 3] = ["fresh", "kept-unread", "unread"];

pub struct Normalizer {
    client: reqwest::Client,
    renderer: Arc<dyn TextRenderer>,
    ignores: Arc<dyn Ignores>,
    always_display_description: bool,
    download_full_page: bool,
    timeout: Duration,
}

impl Normalizer {
    pub fn new(
        config: &Config,
        client: reqwest::Client,
        renderer: Arc<dyn TextRenderer>,
        ignores: Arc<dyn Ignores>,
    ) -> Self {
        Self {
            client,
            renderer,
            ignores,
            always_display_description: config.always_display_description,
            download_full_page: config.download_full_page,
            timeout: Duration::from_secs(config.download_timeout),
        }
    }

    /// Normalizes `raw`, retrieved from `feed_url`.
    ///
    /// Items rejected by the ignore list are dropped. With
    /// `download_full_page`, items without any content cost one extra GET.
    pub async fn normalize(&self, raw: RawFeed, feed_url: &str) -> CanonicalFeed {
        let link = absolute_url(feed_url, &raw.link);
        let title = if is_html_type(&raw.title_type) {
            first_line(&self.renderer.render(&raw.title, &link)).to_string()
        } else {
            single_line(&raw.title)
        };
        let pub_date = if raw.pub_date.is_empty() {
            format_rfc822(&Utc::now())
        } else {
            format_rfc822(&parse_date(&raw.pub_date))
        };
        let language = raw.language.to_lowercase();
        let rtl = RTL_LANGUAGES
            .iter()
            .any(|lang| language.split(['-', '_']).next() == Some(*lang));
        if rtl {
            tracing::debug!(feed = %feed_url, language = %raw.language, "Right-to-left feed");
        }

        let mut feed = CanonicalFeed {
            url: feed_url.to_string(),
            title,
            description: raw.description.clone(),
            link,
            pub_date,
            rtl,
            items: Vec::with_capacity(raw.items.len()),
        };

        let labels_carry_state = raw.dialect.carries_labels();
        for item in &raw.items {
            let canonical = self.normalize_item(&raw, item, &feed, labels_carry_state).await;
            if self.ignores.matches(&canonical) {
                tracing::debug!(
                    feed = %feed_url,
                    title = %canonical.title,
                    link = %canonical.link,
                    "Ignored article"
                );
                continue;
            }
            feed.items.push(canonical);
        }

        tracing::debug!(
            feed = %feed_url,
            title = %feed.title,
            items = feed.items.len(),
            "Feed normalized"
        );
        feed
    }

    async fn normalize_item(
        &self,
        raw: &RawFeed,
        item: &RawItem,
        feed: &CanonicalFeed,
        labels_carry_state: bool,
    ) -> CanonicalItem {
        let mut link = if item.link.is_empty() {
            String::new()
        } else {
            absolute_url(&feed.link, &item.link)
        };
        if link.is_empty() && item.guid_is_permalink {
            link = item.guid.clone();
        }

        let author = [&item.author, &raw.managing_editor, &raw.dc_creator]
            .into_iter()
            .find(|a| !a.is_empty())
            .cloned()
            .unwrap_or_default();

        let (unread, override_unread) = if labels_carry_state && !item.labels.is_empty() {
            read_state(item)
        } else {
            (true, false)
        };

        let (description, description_mime) = self.content(item, &link).await;

        let pub_date_ts = match item.pub_date_ts {
            Some(ts) => ts,
            None if !item.pub_date.is_empty() => parse_date(&item.pub_date).timestamp(),
            None => Utc::now().timestamp(),
        };

        CanonicalItem {
            title: self.item_title(item, &feed.link),
            link,
            author,
            description,
            description_mime,
            pub_date: format_timestamp(pub_date_ts),
            pub_date_ts,
            guid: guid(item),
            base: item.base.clone(),
            feed_url: feed.url.clone(),
            enclosure: pick_enclosure(&item.enclosures).map(Enclosure::from),
            unread,
            override_unread,
            flags: String::new(),
        }
    }

    /// Raw title, else one derived from the link, else the first line of
    /// the content.
    fn item_title(&self, item: &RawItem, feed_link: &str) -> String {
        if !item.title.is_empty() {
            return if is_html_type(&item.title_type) {
                first_line(&self.renderer.render(&item.title, feed_link)).to_string()
            } else {
                single_line(&item.title)
            };
        }

        let derived = make_title(&item.link);
        if !derived.is_empty() {
            return single_line(&derived);
        }

        let body = if item.description.is_empty() {
            &item.content_encoded
        } else {
            &item.description
        };
        first_line(&self.renderer.render(body, feed_link)).to_string()
    }

    async fn content(&self, item: &RawItem, link: &str) -> (String, String) {
        let (mut content, mut mime) = if !item.content_encoded.is_empty() {
            (item.content_encoded.clone(), DEFAULT_MIME.to_string())
        } else if !item.itunes_summary.is_empty() {
            (
                format!("<ituneshack>{}</ituneshack>", item.itunes_summary),
                DEFAULT_MIME.to_string(),
            )
        } else {
            (String::new(), String::new())
        };

        if content.is_empty() {
            content = item.description.clone();
            mime = description_mime(item);
        } else if self.always_display_description && !item.description.is_empty() {
            content = format!("{}<hr>{}", content, item.description);
            mime = DEFAULT_MIME.to_string();
        }

        if content.is_empty() && self.download_full_page && !link.is_empty() {
            match http::get(&self.client, link, &HeaderMap::new(), self.timeout).await {
                Ok(page) => {
                    tracing::debug!(link = %link, bytes = page.bytes.len(), "Downloaded full page");
                    content = String::from_utf8_lossy(&page.bytes).into_owned();
                    mime = page
                        .content_type
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| FULL_PAGE_FALLBACK_MIME.to_string());
                }
                Err(e) => {
                    tracing::warn!(link = %link, error = %e, "Full page download failed");
                }
            }
        }

        (content, mime)
    }
}

fn is_html_type(kind: &str) -> bool {
    matches!(kind, "html" | "xhtml" | "application/xhtml+xml")
}

fn description_mime(item: &RawItem) -> String {
    match item.description_mime.as_str() {
        "" | "html" | "xhtml" => DEFAULT_MIME.to_string(),
        "text" => "text/plain".to_string(),
        other => other.to_string(),
    }
}

/// `(unread, override_unread)` from the item's synchronization labels.
/// A read label wins over an unread one.
fn read_state(item: &RawItem) -> (bool, bool) {
    let is_read = item
        .labels
        .iter()
        .any(|l| l == "read" || l.ends_with(":read"));
    if is_read {
        return (false, true);
    }
    let is_unread = item
        .labels
        .iter()
        .any(|l| UNREAD_LABELS.contains(&l.as_str()) || l.ends_with(":unread"));
    if is_unread {
        return (true, true);
    }
    (true, false)
}

/// guid → link + pubDate → link → title → empty.
fn guid(item: &RawItem) -> String {
    if !item.guid.is_empty() {
        item.guid.clone()
    } else if !item.link.is_empty() && !item.pub_date.is_empty() {
        format!("{}{}", item.link, item.pub_date)
    } else if !item.link.is_empty() {
        item.link.clone()
    } else {
        item.title.clone()
    }
}

/// First podcast-type enclosure, else the first one.
fn pick_enclosure(enclosures: &[RawEnclosure]) -> Option<RawEnclosure> {
    enclosures
        .iter()
        .find(|e| is_podcast_type(&e.mime_type))
        .or_else(|| enclosures.first())
        .cloned()
}

fn is_podcast_type(mime: &str) -> bool {
    mime.starts_with("audio/") || mime.starts_with("video/") || mime == "application/ogg"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::collab::{NoIgnores, PlainTextRenderer};
    use crate::feed::model::Dialect;
    use pretty_assertions::assert_eq;

    fn normalizer(config: &Config) -> Normalizer {
        Normalizer::new(
            config,
            reqwest::Client::new(),
            Arc::new(PlainTextRenderer),
            Arc::new(NoIgnores),
        )
    }

    fn enclosure(mime: &str) -> RawEnclosure {
        RawEnclosure {
            url: format!("https://cdn.example/{}", mime.replace('/', "-")),
            mime_type: mime.to_string(),
            ..RawEnclosure::default()
        }
    }

    #[test]
    fn test_guid_fallback_chain() {
        let mut item = RawItem {
            link: "http://x/1".to_string(),
            pub_date: "D".to_string(),
            title: "T".to_string(),
            ..RawItem::default()
        };
        assert_eq!(guid(&item), "http://x/1D");
        item.pub_date.clear();
        assert_eq!(guid(&item), "http://x/1");
        item.link.clear();
        assert_eq!(guid(&item), "T");
        item.title.clear();
        assert_eq!(guid(&item), "");
    }

    #[test]
    fn test_pick_enclosure_prefers_podcast_types() {
        let enclosures = vec![
            enclosure("image/png"),
            enclosure("audio/mpeg"),
            enclosure("image/jpeg"),
        ];
        assert_eq!(
            pick_enclosure(&enclosures).map(|e| e.mime_type),
            Some("audio/mpeg".to_string())
        );

        let images = vec![enclosure("image/png"), enclosure("image/jpeg")];
        assert_eq!(
            pick_enclosure(&images).map(|e| e.mime_type),
            Some("image/png".to_string())
        );
        assert_eq!(pick_enclosure(&[]), None);
    }

    #[test]
    fn test_read_state_labels() {
        let labelled = |labels: &[&str]| RawItem {
            labels: labels.iter().map(|l| l.to_string()).collect(),
            ..RawItem::default()
        };
        assert_eq!(read_state(&labelled(&["feedbin:unread"])), (true, true));
        assert_eq!(read_state(&labelled(&["feedbin:read"])), (false, true));
        assert_eq!(read_state(&labelled(&["fresh", "read"])), (false, true));
        assert_eq!(read_state(&labelled(&["kept-unread"])), (true, true));
        assert_eq!(read_state(&labelled(&["starred"])), (true, false));
    }

    #[tokio::test]
    async fn test_title_derived_from_link() {
        let raw = RawFeed {
            dialect: Dialect::Rss20,
            items: vec![RawItem {
                link: "https://blog.example/2024/my-cool-post".to_string(),
                ..RawItem::default()
            }],
            ..RawFeed::default()
        };
        let feed = normalizer(&Config::default())
            .normalize(raw, "https://blog.example/feed")
            .await;
        assert_eq!(feed.items[0].title, "My cool post");
    }

    #[tokio::test]
    async fn test_always_display_description_appends() {
        let config = Config {
            always_display_description: true,
            ..Config::default()
        };
        let raw = RawFeed {
            dialect: Dialect::Rss20,
            items: vec![RawItem {
                title: "t".to_string(),
                content_encoded: "A".to_string(),
                description: "B".to_string(),
                ..RawItem::default()
            }],
            ..RawFeed::default()
        };
        let feed = normalizer(&config).normalize(raw, "https://x/feed").await;
        assert_eq!(feed.items[0].description, "A<hr>B");
        assert_eq!(feed.items[0].description_mime, "text/html");
    }

    #[tokio::test]
    async fn test_itunes_summary_and_author_fallback() {
        let raw = RawFeed {
            dialect: Dialect::Rss20,
            dc_creator: "Creator".to_string(),
            items: vec![RawItem {
                title: "Episode".to_string(),
                itunes_summary: "Notes".to_string(),
                ..RawItem::default()
            }],
            ..RawFeed::default()
        };
        let feed = normalizer(&Config::default()).normalize(raw, "https://x/feed").await;
        let item = &feed.items[0];
        assert_eq!(item.description, "<ituneshack>Notes</ituneshack>");
        assert_eq!(item.author, "Creator");
    }

    #[tokio::test]
    async fn test_feed_fields() {
        let raw = RawFeed {
            dialect: Dialect::Atom10,
            title: "<b>Bold</b> title\nsecond".to_string(),
            title_type: "html".to_string(),
            link: "/blog/".to_string(),
            language: "he-IL".to_string(),
            pub_date: "2008-03-07T12:00:00+01:00".to_string(),
            ..RawFeed::default()
        };
        let feed = normalizer(&Config::default())
            .normalize(raw, "https://x.example/feed.xml")
            .await;
        assert_eq!(feed.title, "Bold title");
        assert_eq!(feed.link, "https://x.example/blog/");
        assert_eq!(feed.pub_date, "Fri, 07 Mar 2008 11:00:00 +0000");
        assert!(feed.rtl);
    }

    #[tokio::test]
    async fn test_plain_title_newlines_become_spaces() {
        let raw = RawFeed {
            dialect: Dialect::Rss20,
            items: vec![RawItem {
                title: "  Line one\nline two ".to_string(),
                link: "https://x/a".to_string(),
                ..RawItem::default()
            }],
            ..RawFeed::default()
        };
        let feed = normalizer(&Config::default()).normalize(raw, "https://x/feed").await;
        assert_eq!(feed.items[0].title, "Line one line two");
        assert!(!feed.rtl);
    }
}
