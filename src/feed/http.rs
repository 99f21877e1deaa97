//! HTTP transport for feed downloads: client construction from configuration,
//! conditional GET and size-limited body reads.

use crate::config::Config;
use crate::feed::collab::Validators;
use crate::util::{format_http_date, parse_http_date};
use futures::StreamExt;
use reqwest::header::{
    HeaderMap, HeaderValue, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use reqwest::{ClientBuilder, StatusCode};
use std::time::Duration;
use thiserror::Error;

pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur during a single HTTP download.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured download timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// A downloaded body plus the validators and content type that came with it.
#[derive(Debug, Clone, Default)]
pub struct Download {
    pub bytes: Vec<u8>,
    /// `Last-Modified` as a unix timestamp, 0 if absent.
    pub last_modified: i64,
    /// `ETag`, empty if absent.
    pub etag: String,
    /// `Content-Type` with parameters stripped.
    pub content_type: Option<String>,
}

/// Result of a conditional GET.
#[derive(Debug)]
pub enum ConditionalResponse {
    Fetched(Download),
    /// 304: the server has nothing new. Carries any validators it sent.
    NotModified { last_modified: i64, etag: String },
}

/// Builds a client builder carrying the configured timeout, user agent, proxy
/// and TLS verification settings.
pub fn client_builder(config: &Config) -> Result<ClientBuilder, FetchError> {
    let user_agent = config
        .user_agent
        .clone()
        .unwrap_or_else(|| format!("feedsync/{}", env!("CARGO_PKG_VERSION")));

    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout))
        .user_agent(user_agent);

    if !config.ssl_verifypeer {
        tracing::warn!("TLS certificate verification disabled by configuration");
        builder = builder.danger_accept_invalid_certs(true);
    }

    if config.use_proxy {
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy_url = if proxy.contains("://") {
                proxy.to_string()
            } else {
                format!("{}://{}", config.proxy_type, proxy)
            };
            let mut proxy = reqwest::Proxy::all(&proxy_url)?;
            if let Some(auth) = &config.proxy_auth {
                let (user, pass) = auth.split_once(':').unwrap_or((auth.as_str(), ""));
                proxy = proxy.basic_auth(user, pass);
            }
            tracing::debug!(proxy = %proxy_url, "Using proxy");
            builder = builder.proxy(proxy);
        }
    }

    Ok(builder)
}

/// Builds the shared HTTP client from configuration.
pub fn build_client(config: &Config) -> Result<reqwest::Client, FetchError> {
    Ok(client_builder(config)?.build()?)
}

/// Sends `request` under `timeout`, mapping an elapsed timer to
/// [`FetchError::Timeout`].
pub async fn send_with_timeout(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, FetchError> {
    tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(FetchError::Network)
}

/// GETs `url` sending `validators` as `If-Modified-Since`/`If-None-Match`.
///
/// `extra_headers` are added verbatim (remote service authentication).
pub async fn conditional_get(
    client: &reqwest::Client,
    url: &str,
    validators: &Validators,
    extra_headers: &HeaderMap,
    timeout: Duration,
) -> Result<ConditionalResponse, FetchError> {
    let mut request = client.get(url).headers(extra_headers.clone());

    if validators.last_modified != 0 {
        if let Some(date) = format_http_date(validators.last_modified) {
            request = request.header(IF_MODIFIED_SINCE, date);
        }
    }
    if !validators.etag.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&validators.etag) {
            request = request.header(IF_NONE_MATCH, value);
        }
    }

    let response = send_with_timeout(request, timeout).await?;

    if response.status() == StatusCode::NOT_MODIFIED {
        let (last_modified, etag) = response_validators(response.headers());
        return Ok(ConditionalResponse::NotModified {
            last_modified,
            etag,
        });
    }

    read_response(response).await.map(ConditionalResponse::Fetched)
}

/// Plain GET with `extra_headers`; non-2xx statuses are errors.
pub async fn get(
    client: &reqwest::Client,
    url: &str,
    extra_headers: &HeaderMap,
    timeout: Duration,
) -> Result<Download, FetchError> {
    let request = client.get(url).headers(extra_headers.clone());
    let response = send_with_timeout(request, timeout).await?;
    read_response(response).await
}

async fn read_response(response: reqwest::Response) -> Result<Download, FetchError> {
    if !response.status().is_success() {
        return Err(FetchError::HttpStatus(response.status().as_u16()));
    }

    let (last_modified, etag) = response_validators(response.headers());
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    let bytes = read_limited_bytes(response, MAX_FEED_SIZE).await?;
    Ok(Download {
        bytes,
        last_modified,
        etag,
        content_type,
    })
}

fn response_validators(headers: &HeaderMap) -> (i64, String) {
    let last_modified = headers
        .get(LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .unwrap_or(0);
    let etag = headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (last_modified, etag)
}

/// Reads a response body, failing once more than `limit` bytes arrive.
pub async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_get_success_strips_content_type_params() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html; charset=utf-8"),
            )
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/page", mock_server.uri());
        let download = get(&client, &url, &HeaderMap::new(), TIMEOUT).await.unwrap();
        assert_eq!(download.bytes, b"<html></html>");
        assert_eq!(download.content_type.as_deref(), Some("text/html"));
    }

    #[tokio::test]
    async fn test_get_404_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let result = get(&client, &mock_server.uri(), &HeaderMap::new(), TIMEOUT).await;
        match result {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_get_sends_validators() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header("If-Modified-Since", "Tue, 10 Jun 2003 04:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304).insert_header("ETag", "\"v1\""))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let validators = Validators {
            last_modified: 1055217600,
            etag: "\"v1\"".to_string(),
        };
        let result = conditional_get(
            &client,
            &mock_server.uri(),
            &validators,
            &HeaderMap::new(),
            TIMEOUT,
        )
        .await
        .unwrap();

        match result {
            ConditionalResponse::NotModified { etag, .. } => assert_eq!(etag, "\"v1\""),
            other => panic!("Expected NotModified, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_get_without_validators_sends_none() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("If-None-Match"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("body")
                    .insert_header("Last-Modified", "Tue, 10 Jun 2003 04:00:00 GMT")
                    .insert_header("ETag", "\"v2\""),
            )
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let result = conditional_get(
            &client,
            &mock_server.uri(),
            &Validators::default(),
            &HeaderMap::new(),
            TIMEOUT,
        )
        .await
        .unwrap();

        match result {
            ConditionalResponse::Fetched(download) => {
                assert_eq!(download.last_modified, 1055217600);
                assert_eq!(download.etag, "\"v2\"");
            }
            other => panic!("Expected Fetched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_too_large() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64]))
            .mount(&mock_server)
            .await;

        let client = reqwest::Client::new();
        let response = client.get(mock_server.uri()).send().await.unwrap();
        let result = read_limited_bytes(response, 16).await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[test]
    fn test_client_builder_accepts_proxy_settings() {
        let mut config = Config::default();
        config.use_proxy = true;
        config.proxy = Some("127.0.0.1:3128".to_string());
        config.proxy_auth = Some("user:pass".to_string());
        config.ssl_verifypeer = false;
        assert!(build_client(&config).is_ok());
    }
}
