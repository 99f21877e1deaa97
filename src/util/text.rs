use std::borrow::Cow;

/// Derives a human-readable title from an article link.
///
/// Takes the last path segment, drops the query string and common page
/// suffixes, turns dashes and underscores into spaces, capitalizes the first
/// character and percent-decodes the result.
///
/// # Examples
///
/// ```
/// use feedsync::util::make_title;
///
/// assert_eq!(make_title("https://example.com/2024/05/my-cool-post"), "My cool post");
/// assert_eq!(make_title("https://example.com/a/it%27s_here.html?ref=rss"), "It's here");
/// ```
pub fn make_title(link: &str) -> String {
    let trimmed = link.trim_end_matches('/');
    let segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let segment = segment.split('?').next().unwrap_or(segment);
    let segment = segment
        .trim_end_matches(".html")
        .trim_end_matches(".php")
        .trim_end_matches(".aspx")
        .trim_end_matches(".htm");

    let spaced = segment.replace(['-', '_'], " ");
    let mut chars = spaced.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => return String::new(),
    };

    percent_encoding::percent_decode_str(&capitalized)
        .decode_utf8()
        .map(|s| s.replace('\0', ""))
        .unwrap_or_default()
}

/// Joins the lines of `s` with single spaces and trims the result.
///
/// Used for titles that arrive with embedded line breaks.
pub fn single_line(s: &str) -> String {
    s.replace('\r', "").replace('\n', " ").trim().to_string()
}

/// Returns the first non-empty line of `s`, trimmed.
pub fn first_line(s: &str) -> &str {
    s.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Removes terminal control characters and escape sequences.
///
/// Feed titles and plugin output end up on a terminal; an embedded
/// `ESC [ ... m` must not be able to recolor or move the cursor. Tab, newline
/// and carriage return are kept.
///
/// Returns `Cow::Borrowed` when nothing needed stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_control = |c: char| c == '\x7f' || (c < ' ' && c != '\t' && c != '\n' && c != '\r');

    if !s.chars().any(is_control) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                // CSI: parameters until a final byte in @..~
                Some('[') => {
                    chars.next();
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ESC \
                Some(']') => {
                    chars.next();
                    while let Some(next) = chars.next() {
                        if next == '\x07' {
                            break;
                        }
                        if next == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
        } else if !is_control(c) {
            out.push(c);
        }
    }

    Cow::Owned(out)
}
