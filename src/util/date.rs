//! Date parsing for feed and item timestamps.
//!
//! Feeds carry dates in whatever format their generator liked. Parsing never
//! fails: anything unrecognized becomes "now".

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// `Last-Modified`/`If-Modified-Since` header format.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// RFC 822 format used for normalized publication dates.
const RFC822_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

/// `None` only if the pattern does not compile; the tests pin it down.
fn w3cdtf_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        // Year is mandatory; every further component is optional but only
        // if the previous one is present.
        Regex::new(
            r"^(\d{4})(?:-(\d{2})(?:-(\d{2})(?:T(\d{2})(?::(\d{2})(?::(\d{2})(?:\.\d+)?)?)?)?)?)?(Z|[+-]\d{2}:\d{2})?",
        )
        .ok()
    })
    .as_ref()
}

/// Parses a feed date, falling back to the current time.
///
/// Tried in order: RFC 2822 (which covers RFC 822 and HTTP dates), RFC 3339,
/// `YYYY-MM-DD HH:MM:SS` in UTC, and finally a W3C datetime rewritten to
/// RFC 822.
pub fn parse_date(s: &str) -> DateTime<Utc> {
    try_parse_date(s).unwrap_or_else(|| {
        if !s.trim().is_empty() {
            tracing::debug!(date = %s, "Unparseable date, using current time");
        }
        Utc::now()
    })
}

/// Like [`parse_date`] but reports failure instead of substituting "now".
pub fn try_parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    let rewritten = w3cdtf_to_rfc822(s)?;
    DateTime::parse_from_rfc2822(&rewritten)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Rewrites a (possibly truncated) W3C datetime into an RFC 822 date in UTC.
///
/// Missing components default to the start of the period: `"2024"` becomes
/// 1 January 2024, midnight. Returns `None` when not even a year is present.
///
/// # Examples
///
/// ```
/// use feedsync::util::w3cdtf_to_rfc822;
///
/// assert_eq!(
///     w3cdtf_to_rfc822("2008-03-07T12:00:00+01:00").as_deref(),
///     Some("Fri, 07 Mar 2008 11:00:00 +0000")
/// );
/// ```
pub fn w3cdtf_to_rfc822(w3cdtf: &str) -> Option<String> {
    let caps = w3cdtf_regex()?.captures(w3cdtf.trim())?;
    let num = |i: usize, default: u32| -> Option<u32> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(default),
        }
    };

    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2, 1)?, num(3, 1)?)?;
    let naive = date.and_hms_opt(num(4, 0)?, num(5, 0)?, num(6, 0)?)?;

    let offset_secs = match caps.get(7).map(|m| m.as_str()) {
        Some(tz) if tz != "Z" => {
            let hours: i64 = tz.get(1..3)?.parse().ok()?;
            let minutes: i64 = tz.get(4..6)?.parse().ok()?;
            let secs = hours * 3600 + minutes * 60;
            if tz.starts_with('-') {
                -secs
            } else {
                secs
            }
        }
        _ => 0,
    };

    let utc = naive - chrono::Duration::seconds(offset_secs);
    Some(utc.format(RFC822_FORMAT).to_string())
}

/// Formats a timestamp as an RFC 822 date in UTC.
pub fn format_rfc822(dt: &DateTime<Utc>) -> String {
    dt.format(RFC822_FORMAT).to_string()
}

/// Formats a unix timestamp as an RFC 822 date; empty when out of range.
pub fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| format_rfc822(&dt))
        .unwrap_or_default()
}

/// Formats a unix timestamp for an `If-Modified-Since` header.
pub fn format_http_date(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|dt| dt.format(HTTP_DATE_FORMAT).to_string())
}

/// Parses a `Last-Modified` header into a unix timestamp.
pub fn parse_http_date(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(s.trim())
        .ok()
        .map(|dt| dt.timestamp())
}
