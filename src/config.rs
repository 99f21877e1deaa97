//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Where the list of subscribed feed URLs comes from, and therefore which
/// remote service (if any) owns read state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlsSource {
    /// Plain feed URLs; no remote service.
    #[default]
    Local,
    Ttrss,
    Newsblur,
    Feedbin,
    Freshrss,
    Feedhq,
    Inoreader,
    Oldreader,
    Ocnews,
    Feedly,
    Miniflux,
}

impl UrlsSource {
    /// Name used as the prefix of synchronization labels (`"<name>:unread"`).
    pub fn name(self) -> &'static str {
        match self {
            UrlsSource::Local => "local",
            UrlsSource::Ttrss => "ttrss",
            UrlsSource::Newsblur => "newsblur",
            UrlsSource::Feedbin => "feedbin",
            UrlsSource::Freshrss => "freshrss",
            UrlsSource::Feedhq => "feedhq",
            UrlsSource::Inoreader => "inoreader",
            UrlsSource::Oldreader => "oldreader",
            UrlsSource::Ocnews => "ocnews",
            UrlsSource::Feedly => "feedly",
            UrlsSource::Miniflux => "miniflux",
        }
    }
}

impl std::fmt::Display for UrlsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings shared by every remote service table (`[ttrss]`, `[feedbin]`, ...).
///
/// Not every service reads every key: `mode` is TT-RSS only, `app_id` and
/// `app_key` are Inoreader only, `token*` is read by Feedly.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the service. Empty means the service's public default.
    pub url: String,
    pub login: String,
    pub password: Option<String>,
    /// File whose first line is the password (`~` is expanded).
    pub password_file: Option<String>,
    /// Shell command whose first output line is the password.
    pub password_eval: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<String>,
    pub token_eval: Option<String>,
    /// Local flag character mirrored to the service's "starred" state.
    pub flag_star: String,
    /// Local flag character mirrored to the service's "shared"/"published" state.
    pub flag_share: String,
    /// Minimum number of articles to request per feed.
    pub min_items: u32,
    /// TT-RSS authentication mode: `"multi"` or `"single"`.
    pub mode: String,
    pub app_id: Option<String>,
    pub app_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            login: String::new(),
            password: None,
            password_file: None,
            password_eval: None,
            token: None,
            token_file: None,
            token_eval: None,
            flag_star: String::new(),
            flag_share: String::new(),
            min_items: 20,
            mode: "multi".to_string(),
            app_id: None,
            app_key: None,
        }
    }
}

impl ProviderConfig {
    /// First character of `flag_star`, if configured.
    pub fn star_flag(&self) -> Option<char> {
        self.flag_star.chars().next()
    }

    /// First character of `flag_share`, if configured.
    pub fn share_flag(&self) -> Option<char> {
        self.flag_share.chars().next()
    }
}

/// SEC-015: Mask passwords and tokens in Debug output.
impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("url", &self.url)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("password_file", &self.password_file)
            .field("password_eval", &self.password_eval)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("token_file", &self.token_file)
            .field("token_eval", &self.token_eval)
            .field("flag_star", &self.flag_star)
            .field("flag_share", &self.flag_share)
            .field("min_items", &self.min_items)
            .field("mode", &self.mode)
            .field("app_id", &self.app_id)
            .field("app_key", &self.app_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// One `[[ignore_article]]` rule: items of matching feeds whose title matches
/// `title` (a regular expression) are dropped during normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct IgnoreRule {
    /// Feed URL the rule applies to, or `"*"` for every feed.
    pub feed: String,
    pub title: String,
}

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
///
/// SEC-015: Custom Debug impl masks `proxy_auth` to prevent secret leakage
/// in logs, error messages, and debug output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub urls_source: UrlsSource,

    /// Number of attempts for a direct HTTP feed download.
    pub download_retries: u32,

    /// Per-request network timeout in seconds.
    pub download_timeout: u64,

    /// Maximum number of feeds reloaded concurrently.
    pub reload_threads: usize,

    pub user_agent: Option<String>,

    pub use_proxy: bool,
    pub proxy: Option<String>,
    /// `user:password` for the proxy.
    pub proxy_auth: Option<String>,
    /// Proxy scheme used when `proxy` has none (`http`, `https`).
    pub proxy_type: String,

    /// Verify TLS certificates.
    pub ssl_verifypeer: bool,

    /// File where session cookies are kept between runs.
    pub cookie_cache: Option<PathBuf>,

    /// Fetch the article page when an item carries no content.
    pub download_full_page: bool,

    /// Append the item description to existing content instead of dropping it.
    pub always_display_description: bool,

    /// Feed URLs downloaded unconditionally (no ETag/Last-Modified validators).
    pub always_download: Vec<String>,

    pub ignore_article: Vec<IgnoreRule>,

    pub ttrss: ProviderConfig,
    pub newsblur: ProviderConfig,
    pub feedbin: ProviderConfig,
    pub freshrss: ProviderConfig,
    pub feedhq: ProviderConfig,
    pub inoreader: ProviderConfig,
    pub oldreader: ProviderConfig,
    pub ocnews: ProviderConfig,
    pub feedly: ProviderConfig,
    pub miniflux: ProviderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            urls_source: UrlsSource::Local,
            download_retries: 1,
            download_timeout: 30,
            reload_threads: 1,
            user_agent: None,
            use_proxy: false,
            proxy: None,
            proxy_auth: None,
            proxy_type: "http".to_string(),
            ssl_verifypeer: true,
            cookie_cache: None,
            download_full_page: false,
            always_display_description: false,
            always_download: Vec::new(),
            ignore_article: Vec::new(),
            ttrss: ProviderConfig::default(),
            newsblur: ProviderConfig::default(),
            feedbin: ProviderConfig::default(),
            freshrss: ProviderConfig::default(),
            feedhq: ProviderConfig::default(),
            inoreader: ProviderConfig::default(),
            oldreader: ProviderConfig::default(),
            ocnews: ProviderConfig::default(),
            feedly: ProviderConfig::default(),
            miniflux: ProviderConfig::default(),
        }
    }
}

/// SEC-015: Mask proxy_auth in Debug output to prevent secret leakage.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("urls_source", &self.urls_source)
            .field("download_retries", &self.download_retries)
            .field("download_timeout", &self.download_timeout)
            .field("reload_threads", &self.reload_threads)
            .field("user_agent", &self.user_agent)
            .field("use_proxy", &self.use_proxy)
            .field("proxy", &self.proxy)
            .field("proxy_auth", &self.proxy_auth.as_ref().map(|_| "[REDACTED]"))
            .field("proxy_type", &self.proxy_type)
            .field("ssl_verifypeer", &self.ssl_verifypeer)
            .field("cookie_cache", &self.cookie_cache)
            .field("download_full_page", &self.download_full_page)
            .field(
                "always_display_description",
                &self.always_display_description,
            )
            .field("always_download", &self.always_download)
            .field("ignore_article", &self.ignore_article)
            .field("ttrss", &self.ttrss)
            .field("newsblur", &self.newsblur)
            .field("feedbin", &self.feedbin)
            .field("freshrss", &self.freshrss)
            .field("feedhq", &self.feedhq)
            .field("inoreader", &self.inoreader)
            .field("oldreader", &self.oldreader)
            .field("ocnews", &self.ocnews)
            .field("feedly", &self.feedly)
            .field("miniflux", &self.miniflux)
            .finish()
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 25] = [
        "urls_source",
        "download_retries",
        "download_timeout",
        "reload_threads",
        "user_agent",
        "use_proxy",
        "proxy",
        "proxy_auth",
        "proxy_type",
        "ssl_verifypeer",
        "cookie_cache",
        "download_full_page",
        "always_display_description",
        "always_download",
        "ignore_article",
        "ttrss",
        "newsblur",
        "feedbin",
        "freshrss",
        "feedhq",
        "inoreader",
        "oldreader",
        "ocnews",
        "feedly",
        "miniflux",
    ];

    /// Default location: `<config dir>/feedsync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("feedsync").join("config.toml"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        // from a maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content, path)
    }

    fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            path = %path.display(),
            urls_source = %config.urls_source,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Settings table of the given remote service. `Local` has none.
    pub fn provider(&self, source: UrlsSource) -> Option<&ProviderConfig> {
        match source {
            UrlsSource::Local => None,
            UrlsSource::Ttrss => Some(&self.ttrss),
            UrlsSource::Newsblur => Some(&self.newsblur),
            UrlsSource::Feedbin => Some(&self.feedbin),
            UrlsSource::Freshrss => Some(&self.freshrss),
            UrlsSource::Feedhq => Some(&self.feedhq),
            UrlsSource::Inoreader => Some(&self.inoreader),
            UrlsSource::Oldreader => Some(&self.oldreader),
            UrlsSource::Ocnews => Some(&self.ocnews),
            UrlsSource::Feedly => Some(&self.feedly),
            UrlsSource::Miniflux => Some(&self.miniflux),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
