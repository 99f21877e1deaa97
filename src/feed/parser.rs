use crate::feed::model::{Dialect, RawEnclosure, RawFeed, RawItem};
use crate::util::{absolute_url, format_rfc822, w3cdtf_to_rfc822};
use feed_rs::model::{Entry, FeedType, Text};
use feed_rs::parser;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::{NsReader, Reader};
use thiserror::Error;

/// Category scheme under which Google-Reader-style services publish item
/// state (`read`, `fresh`, `kept-unread`) in Atom streams.
const GOOGLE_READER_SCHEME: &str = "http://www.google.com/reader/";

const ATOM_03_NAMESPACE: &str = "http://purl.org/atom/ns#";

const DC_NAMESPACE: &[u8] = b"http://purl.org/dc/elements/1.1/";

/// Namespaces whose `author`/`pubDate`/`updated` elements are the feed's
/// own, as opposed to e.g. `itunes:author`.
const FEED_NAMESPACES: [&[u8]; 4] = [
    b"http://www.w3.org/2005/Atom",
    ATOM_03_NAMESPACE.as_bytes(),
    b"http://purl.org/rss/1.0/",
    b"http://my.netscape.com/rdf/simple/0.9/",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Feed could not be parsed: {0}")]
    Feed(#[from] parser::ParseFeedError),
}

/// Parses an RSS, Atom or JSON Feed document into a [`RawFeed`].
///
/// The returned dialect is never `Unknown`; unparseable input is an error.
pub fn parse_feed(bytes: &[u8]) -> Result<RawFeed, ParseError> {
    // Ids are left empty when the document has none so that the normalizer's
    // guid fallback chain decides, not a generated hash.
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)?;

    let dialect = match feed.feed_type {
        FeedType::RSS0 | FeedType::RSS2 => rss_version(bytes),
        FeedType::RSS1 => Dialect::Rss10,
        FeedType::Atom => {
            if root_namespace(bytes).as_deref() == Some(ATOM_03_NAMESPACE) {
                Dialect::Atom03
            } else {
                Dialect::Atom10
            }
        }
        FeedType::JSON => Dialect::JsonFeed,
    };

    // feed-rs keeps neither the wire date strings nor dc:creator and
    // xml:base, and for RSS it stores the element name as the person name.
    let wire = if dialect == Dialect::JsonFeed {
        WireFields::default()
    } else {
        scan_wire_fields(bytes)
    };

    let (title, title_type) = split_text(feed.title.as_ref());
    let managing_editor = if dialect.is_rss() {
        split_rss_author(&wire.managing_editor).0
    } else {
        feed.authors
            .first()
            .or_else(|| feed.contributors.first())
            .map(|p| p.name.clone())
            .unwrap_or_default()
    };

    let items = feed
        .entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| convert_entry(entry, dialect, wire.items.get(index)))
        .collect();

    Ok(RawFeed {
        dialect,
        title,
        title_type,
        description: feed.description.map(|d| d.content).unwrap_or_default(),
        link: pick_link(&feed.links).unwrap_or_default(),
        language: feed.language.unwrap_or_default(),
        pub_date: feed
            .published
            .or(feed.updated)
            .map(|dt| format_rfc822(&dt))
            .unwrap_or_default(),
        managing_editor,
        dc_creator: wire.dc_creator,
        items,
    })
}

fn convert_entry(entry: Entry, dialect: Dialect, wire: Option<&WireItem>) -> RawItem {
    let (title, title_type) = split_text(entry.title.as_ref());
    let item_base = wire.map(|w| w.item_base.as_str()).unwrap_or_default();
    let resolve = |url: String| {
        if item_base.is_empty() || url.is_empty() {
            url
        } else {
            absolute_url(item_base, &url)
        }
    };
    let link = resolve(pick_link(&entry.links).unwrap_or_default());

    let (author, author_email) = match wire {
        Some(w) if dialect.is_rss() => {
            if w.author.is_empty() {
                (w.creator.clone(), String::new())
            } else {
                split_rss_author(&w.author)
            }
        }
        _ => {
            let person = entry.authors.first();
            (
                person.map(|p| p.name.clone()).unwrap_or_default(),
                person.and_then(|p| p.email.clone()).unwrap_or_default(),
            )
        }
    };

    let (mut content_encoded, mut description, mut description_mime) =
        (String::new(), String::new(), String::new());
    if let Some(summary) = &entry.summary {
        description = summary.content.clone();
        description_mime = summary.content_type.to_string();
    }
    if let Some(content) = &entry.content {
        let body = content.body.clone().unwrap_or_default();
        let mime = content.content_type.to_string();
        if mime.contains("html") {
            content_encoded = body;
        } else if description.is_empty() {
            description = body;
            description_mime = mime;
        }
    }

    // Podcast feeds put the episode notes on the media object only.
    let itunes_summary = entry
        .media
        .iter()
        .find_map(|m| m.description.as_ref())
        .map(|d| d.content.clone())
        .unwrap_or_default();

    let mut enclosures: Vec<RawEnclosure> = Vec::new();
    for media in &entry.media {
        let (media_description, media_description_mime) = split_text(media.description.as_ref());
        for content in &media.content {
            if let Some(url) = &content.url {
                enclosures.push(RawEnclosure {
                    url: resolve(url.to_string()),
                    mime_type: content
                        .content_type
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    description: media_description.clone(),
                    description_mime: media_description_mime.clone(),
                });
            }
        }
    }
    for link in entry
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
    {
        let url = resolve(link.href.clone());
        if !enclosures.iter().any(|e| e.url == url) {
            enclosures.push(RawEnclosure {
                url,
                mime_type: link.media_type.clone().unwrap_or_default(),
                ..RawEnclosure::default()
            });
        }
    }

    let labels = entry
        .categories
        .iter()
        .filter(|c| c.scheme.as_deref() == Some(GOOGLE_READER_SCHEME))
        .map(|c| c.label.clone().unwrap_or_else(|| c.term.clone()))
        .collect();

    let published = entry.published.or(entry.updated);
    let guid = entry.id.trim().to_string();
    // RSS 2.0 guids are permalinks unless stated otherwise; only URL-shaped
    // ones are usable as links.
    let guid_is_permalink = matches!(dialect, Dialect::Rss20 | Dialect::Rss092 | Dialect::Rss094)
        && (guid.starts_with("http://") || guid.starts_with("https://"));

    let pub_date = match wire {
        Some(w) => wire_pub_date(w, dialect),
        None => published.map(|dt| format_rfc822(&dt)).unwrap_or_default(),
    };
    let base = match wire {
        Some(w) if !w.content_base.is_empty() => w.content_base.clone(),
        _ => item_base.to_string(),
    };

    RawItem {
        title,
        title_type,
        link,
        author,
        author_email,
        content_encoded,
        description,
        description_mime,
        itunes_summary,
        pub_date,
        pub_date_ts: published.map(|dt| dt.timestamp()),
        guid,
        guid_is_permalink,
        base,
        enclosures,
        labels,
    }
}

/// The item's date as written in the document. RSS 0.9x/2.0 `pubDate` is
/// kept verbatim; W3C datetimes (`dc:date`, Atom) are rewritten to RFC 822
/// and kept verbatim when they do not parse.
fn wire_pub_date(wire: &WireItem, dialect: Dialect) -> String {
    let w3c = |s: &str| w3cdtf_to_rfc822(s).unwrap_or_else(|| s.to_string());
    if !wire.pub_date.is_empty() {
        match dialect {
            Dialect::Atom03 | Dialect::Atom10 => w3c(&wire.pub_date),
            _ => wire.pub_date.clone(),
        }
    } else if !wire.fallback_date.is_empty() {
        w3c(&wire.fallback_date)
    } else {
        String::new()
    }
}

/// Splits an RSS `<author>` value into display name and email.
///
/// `"jo@b.example (Jo)"` and `"Jo <jo@b.example>"` both give
/// `("Jo", "jo@b.example")`. A bare address is used as both.
pub(crate) fn split_rss_author(field: &str) -> (String, String) {
    let field = field.trim();
    if let (Some(open), Some(close)) = (field.find('('), field.rfind(')')) {
        if open < close {
            let name = field[open + 1..close].trim();
            let email = field[..open].trim();
            if !name.is_empty() {
                return (name.to_string(), email.to_string());
            }
        }
    }
    if let (Some(open), Some(close)) = (field.find('<'), field.rfind('>')) {
        if open < close {
            let name = field[..open].trim();
            let email = field[open + 1..close].trim();
            let name = if name.is_empty() { email } else { name };
            return (name.to_string(), email.to_string());
        }
    }
    let email = if field.contains('@') && !field.contains(char::is_whitespace) {
        field.to_string()
    } else {
        String::new()
    };
    (field.to_string(), email)
}

// ============================================================================
// Wire fields
// ============================================================================

/// Values read straight from the XML that feed-rs does not expose.
#[derive(Debug, Default)]
struct WireFields {
    managing_editor: String,
    dc_creator: String,
    /// One per `item`/`entry`, in document order.
    items: Vec<WireItem>,
}

#[derive(Debug, Default)]
struct WireItem {
    author: String,
    creator: String,
    /// `pubDate` (RSS) or `published`/`issued` (Atom).
    pub_date: String,
    /// `dc:date` (RSS) or `updated`/`modified` (Atom).
    fallback_date: String,
    /// Effective `xml:base` of the item element.
    item_base: String,
    /// `xml:base` of the description/content element, if it sets one.
    content_base: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireField {
    ManagingEditor,
    ChannelCreator,
    Author,
    Creator,
    PubDate,
    FallbackDate,
}

struct Frame {
    local: Vec<u8>,
    base: String,
}

/// Reads the fields of [`WireFields`] in one streaming pass. Malformed
/// input stops the scan and keeps what was read so far.
fn scan_wire_fields(bytes: &[u8]) -> WireFields {
    let mut reader = NsReader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut fields = WireFields::default();
    let mut stack: Vec<Frame> = Vec::new();
    // Depth of the open item element, if any.
    let mut item_depth: Option<usize> = None;
    // Field being captured and the depth of its element.
    let mut capture: Option<(WireField, usize, String)> = None;

    loop {
        let (ns, event) = match reader.read_resolved_event_into(&mut buf) {
            Ok((ns, event)) => (resolved_namespace(ns), event),
            Err(e) => {
                tracing::debug!(error = %e, "Stopped scanning feed document");
                break;
            }
        };
        match event {
            Event::Start(e) => {
                let parent_base = stack.last().map(|f| f.base.as_str()).unwrap_or_default();
                let own_base = xml_base(&e, &reader);
                let base = match &own_base {
                    Some(b) if parent_base.is_empty() => b.clone(),
                    Some(b) => absolute_url(parent_base, b),
                    None => parent_base.to_string(),
                };
                let local = e.local_name().as_ref().to_vec();
                let depth = stack.len();
                let parent = stack.last().map(|f| f.local.as_slice());

                match item_depth {
                    None if matches!(local.as_slice(), b"item" | b"entry") => {
                        item_depth = Some(depth);
                        fields.items.push(WireItem {
                            item_base: base.clone(),
                            ..WireItem::default()
                        });
                    }
                    Some(d) if depth == d + 1 => {
                        let is_body =
                            matches!(local.as_slice(), b"description" | b"content" | b"encoded");
                        if let Some(item) = fields.items.last_mut() {
                            if is_body && own_base.is_some() && item.content_base.is_empty() {
                                item.content_base = base.clone();
                            }
                        }
                        capture = item_field(&local, ns.as_deref())
                            .map(|f| (f, depth, String::new()));
                    }
                    None if parent == Some(b"channel".as_slice()) => {
                        capture = channel_field(&local, ns.as_deref())
                            .map(|f| (f, depth, String::new()));
                    }
                    _ => {}
                }
                stack.push(Frame { local, base });
            }
            // Keeps item indices aligned with feed-rs entries.
            Event::Empty(e)
                if item_depth.is_none()
                    && matches!(e.local_name().as_ref(), b"item" | b"entry") =>
            {
                let item_base = stack.last().map(|f| f.base.clone()).unwrap_or_default();
                fields.items.push(WireItem {
                    item_base,
                    ..WireItem::default()
                });
            }
            Event::Text(t) => {
                if let Some((_, _, text)) = capture.as_mut() {
                    if let Ok(unescaped) = t.unescape() {
                        text.push_str(&unescaped);
                    }
                }
            }
            Event::CData(c) => {
                if let Some((_, _, text)) = capture.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(_) => {
                stack.pop();
                let depth = stack.len();
                if let Some((field, at, text)) = capture.take() {
                    if at == depth {
                        store(&mut fields, field, text.trim());
                    } else {
                        capture = Some((field, at, text));
                    }
                }
                if item_depth == Some(depth) {
                    item_depth = None;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    fields
}

fn resolved_namespace(ns: ResolveResult) -> Option<Vec<u8>> {
    match ns {
        ResolveResult::Bound(Namespace(uri)) => Some(uri.to_vec()),
        _ => None,
    }
}

fn xml_base(e: &BytesStart, reader: &NsReader<&[u8]>) -> Option<String> {
    e.attributes()
        .filter_map(Result::ok)
        .find(|a| a.key.as_ref() == b"xml:base")
        .and_then(|a| a.decode_and_unescape_value(reader.decoder()).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn item_field(local: &[u8], ns: Option<&[u8]>) -> Option<WireField> {
    if ns == Some(DC_NAMESPACE) {
        return match local {
            b"creator" => Some(WireField::Creator),
            b"date" => Some(WireField::FallbackDate),
            _ => None,
        };
    }
    if ns.is_some_and(|ns| !FEED_NAMESPACES.iter().any(|known| *known == ns)) {
        return None;
    }
    match local {
        b"author" => Some(WireField::Author),
        b"pubDate" | b"published" | b"issued" => Some(WireField::PubDate),
        b"updated" | b"modified" => Some(WireField::FallbackDate),
        _ => None,
    }
}

fn channel_field(local: &[u8], ns: Option<&[u8]>) -> Option<WireField> {
    match local {
        b"creator" if ns == Some(DC_NAMESPACE) => Some(WireField::ChannelCreator),
        b"managingEditor" if ns.is_none() => Some(WireField::ManagingEditor),
        _ => None,
    }
}

/// Keeps the first non-empty value of each field.
fn store(fields: &mut WireFields, field: WireField, value: &str) {
    let slot = match field {
        WireField::ManagingEditor => &mut fields.managing_editor,
        WireField::ChannelCreator => &mut fields.dc_creator,
        _ => {
            let Some(item) = fields.items.last_mut() else {
                return;
            };
            match field {
                WireField::Author => &mut item.author,
                WireField::Creator => &mut item.creator,
                WireField::PubDate => &mut item.pub_date,
                _ => &mut item.fallback_date,
            }
        }
    };
    if slot.is_empty() {
        *slot = value.to_string();
    }
}

/// Splits a feed-rs text into its content and a short type name
/// (`"html"`, `"xhtml"` or `"text"`).
fn split_text(text: Option<&Text>) -> (String, String) {
    match text {
        Some(t) => {
            let mime = t.content_type.to_string();
            let kind = if mime.contains("xhtml") {
                "xhtml"
            } else if mime.contains("html") {
                "html"
            } else {
                "text"
            };
            (t.content.clone(), kind.to_string())
        }
        None => (String::new(), String::new()),
    }
}

/// First `alternate` (or rel-less) link, else the first non-enclosure link.
fn pick_link(links: &[feed_rs::model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| {
            links
                .iter()
                .find(|l| !matches!(l.rel.as_deref(), Some("enclosure") | Some("self")))
        })
        .map(|l| l.href.clone())
}

/// Reads the root element's attributes without building a tree.
fn root_attribute(bytes: &[u8], name: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e
                    .attributes()
                    .filter_map(Result::ok)
                    .find(|a| a.key.as_ref() == name)
                    .and_then(|a| {
                        a.decode_and_unescape_value(reader.decoder())
                            .ok()
                            .map(|v| v.trim().to_string())
                    });
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn root_namespace(bytes: &[u8]) -> Option<String> {
    root_attribute(bytes, b"xmlns")
}

fn rss_version(bytes: &[u8]) -> Dialect {
    match root_attribute(bytes, b"version").as_deref() {
        Some("0.91") => Dialect::Rss091,
        Some("0.92") => Dialect::Rss092,
        Some("0.94") => Dialect::Rss094,
        _ => Dialect::Rss20,
    }
}
