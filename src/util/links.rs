use std::path::PathBuf;
use url::Url;

/// Resolves `link` against `base`, returning `link` unchanged when either
/// fails to parse.
///
/// # Examples
///
/// ```
/// use feedsync::util::absolute_url;
///
/// assert_eq!(absolute_url("https://example.com/blog/feed.xml", "post/1"), "https://example.com/blog/post/1");
/// assert_eq!(absolute_url("not a url", "post/1"), "post/1");
/// ```
pub fn absolute_url(base: &str, link: &str) -> String {
    Url::parse(base)
        .and_then(|url| url.join(link))
        .map(String::from)
        .unwrap_or_else(|_| link.to_string())
}

/// Expands a leading `~` or `~/` to the user's home directory.
pub fn resolve_tilde(path: &str) -> PathBuf {
    match (path, dirs::home_dir()) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_url_relative_path() {
        assert_eq!(
            absolute_url("http://foobar/hello/crook/", "bar.html"),
            "http://foobar/hello/crook/bar.html"
        );
        assert_eq!(
            absolute_url("https://foobar/foo/", "/bar.html"),
            "https://foobar/bar.html"
        );
    }

    #[test]
    fn test_absolute_url_already_absolute() {
        assert_eq!(
            absolute_url("http://foobar/", "https://other.org/x"),
            "https://other.org/x"
        );
    }

    #[test]
    fn test_absolute_url_empty_link_is_base() {
        assert_eq!(absolute_url("http://foobar/a", ""), "http://foobar/a");
    }

    #[test]
    fn test_resolve_tilde_passthrough() {
        assert_eq!(resolve_tilde("/etc/passwd"), PathBuf::from("/etc/passwd"));
        assert_eq!(resolve_tilde("rel/~/x"), PathBuf::from("rel/~/x"));
    }

    #[test]
    fn test_resolve_tilde_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_tilde("~"), home);
            assert_eq!(resolve_tilde("~/.pw"), home.join(".pw"));
        }
    }
}
