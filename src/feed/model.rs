use std::collections::BTreeSet;

// ============================================================================
// Raw (wire-level) Types
// ============================================================================

/// Wire format a [`RawFeed`] was read from.
///
/// `Unknown` doubles as the "nothing usable was retrieved" marker: the HTTP
/// retry loop keeps going while the parsed dialect is still `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Unknown,
    Rss091,
    Rss092,
    Rss094,
    Rss10,
    Rss20,
    Atom03,
    Atom10,
    JsonFeed,
    TtrssJson,
    NewsblurJson,
    OcnewsJson,
    MinifluxJson,
    FeedbinJson,
    FreshrssJson,
    FeedlyJson,
}

impl Dialect {
    pub fn is_rss(self) -> bool {
        matches!(
            self,
            Dialect::Rss091 | Dialect::Rss092 | Dialect::Rss094 | Dialect::Rss10 | Dialect::Rss20
        )
    }

    /// Whether item labels carry synchronization state for this dialect.
    pub fn carries_labels(self) -> bool {
        matches!(
            self,
            Dialect::Atom10
                | Dialect::JsonFeed
                | Dialect::TtrssJson
                | Dialect::NewsblurJson
                | Dialect::OcnewsJson
                | Dialect::MinifluxJson
                | Dialect::FeedbinJson
                | Dialect::FreshrssJson
                | Dialect::FeedlyJson
        )
    }
}

/// A parsed feed before normalization. Created per fetch and discarded once
/// normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFeed {
    pub dialect: Dialect,
    pub title: String,
    /// MIME-ish type of `title`: `"text"`, `"html"`, `"xhtml"`.
    pub title_type: String,
    pub description: String,
    pub link: String,
    pub language: String,
    pub pub_date: String,
    pub managing_editor: String,
    pub dc_creator: String,
    pub items: Vec<RawItem>,
}

impl RawFeed {
    /// An empty feed of the given dialect.
    pub fn empty(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawItem {
    pub title: String,
    pub title_type: String,
    pub link: String,
    pub author: String,
    pub author_email: String,
    pub content_encoded: String,
    pub description: String,
    pub description_mime: String,
    pub itunes_summary: String,
    /// Date string as the document has it; also the guid fallback input.
    pub pub_date: String,
    /// Parsed `pub_date`, when the parser could read it.
    pub pub_date_ts: Option<i64>,
    pub guid: String,
    pub guid_is_permalink: bool,
    /// `xml:base` of the item, if any.
    pub base: String,
    pub enclosures: Vec<RawEnclosure>,
    /// Out-of-band synchronization state, e.g. `"feedbin:unread"`.
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEnclosure {
    pub url: String,
    pub mime_type: String,
    pub description: String,
    pub description_mime: String,
}

// ============================================================================
// Canonical Types
// ============================================================================

/// The single enclosure kept on a canonical item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: String,
    pub description: String,
    pub description_mime: String,
}

impl From<RawEnclosure> for Enclosure {
    fn from(raw: RawEnclosure) -> Self {
        Self {
            url: raw.url,
            mime_type: raw.mime_type,
            description: raw.description,
            description_mime: raw.description_mime,
        }
    }
}

/// An article as handed to the cache and UI.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalItem {
    pub title: String,
    pub link: String,
    pub author: String,
    pub description: String,
    pub description_mime: String,
    /// RFC 822 date in UTC.
    pub pub_date: String,
    /// Unix timestamp of `pub_date`.
    pub pub_date_ts: i64,
    pub guid: String,
    pub base: String,
    pub feed_url: String,
    pub enclosure: Option<Enclosure>,
    pub unread: bool,
    /// When set, `unread` replaces whatever state the cache holds for `guid`.
    pub override_unread: bool,
    /// User flag characters (e.g. `"s"` for starred).
    pub flags: String,
}

/// A feed as handed to the cache and UI.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalFeed {
    pub url: String,
    pub title: String,
    pub description: String,
    pub link: String,
    pub pub_date: String,
    /// Render right-to-left.
    pub rtl: bool,
    pub items: Vec<CanonicalItem>,
}
