//! HTTP client wrapper for ranged GET requests.
//!
//! This module provides the `HttpClient` struct which issues the single GET a
//! fetch attempt needs (with an optional `Range` header and per-transfer extra
//! headers) and the helpers that interpret `Content-Length`/`Content-Range`.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, POOL_IDLE_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::user_agent;

/// HTTP client for streaming downloads.
///
/// Created once per manager and cloned into every fetch worker so connections
/// are pooled across transfers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default connect timeout.
    ///
    /// Response decompression stays disabled: resume offsets and announced
    /// sizes must refer to the bytes written to disk.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_connect_timeout(CONNECT_TIMEOUT_SECS)
    }

    /// Creates a client with an explicit connect timeout.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot be initialized.
    pub fn with_connect_timeout(connect_timeout_secs: u64) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .user_agent(user_agent::default_download_user_agent())
            .build()?;
        Ok(Self { client })
    }

    /// Sends a GET for `url`, resuming from `range_start` when given.
    ///
    /// Success statuses and `206 Partial Content` are returned as-is. When a
    /// range was requested, `416 Range Not Satisfiable` is also returned so the
    /// caller can inspect the `Content-Range` total. Every other status is an
    /// error.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InvalidUrl`] for malformed or non-HTTP(S) URLs
    /// - [`DownloadError::InvalidHeader`] for unusable extra headers
    /// - [`DownloadError::Timeout`] when no response arrives within `timeout`
    /// - [`DownloadError::Network`] for transport failures
    /// - [`DownloadError::HttpStatus`] for non-success statuses
    #[instrument(level = "debug", skip(self, headers), fields(url = %url))]
    pub async fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        range_start: Option<u64>,
        timeout: Duration,
    ) -> Result<Response, DownloadError> {
        validate_url(url)?;

        let mut request = self.client.get(url);
        for (name, value) in headers {
            let (name, value) = parse_header(name, value)?;
            request = request.header(name, value);
        }
        if let Some(offset) = range_start {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }

        let timeout_secs = timeout.as_secs();
        let response = match tokio::time::timeout(timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(DownloadError::network(url, e, timeout_secs)),
            Err(_) => return Err(DownloadError::timeout(url, timeout_secs)),
        };

        let status = response.status();
        debug!(status = status.as_u16(), ?range_start, "response received");
        if status.is_success() {
            return Ok(response);
        }
        if range_start.is_some() && status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(response);
        }
        Err(DownloadError::http_status(url, status.as_u16()))
    }
}

/// Rejects URLs that are not absolute HTTP(S) URLs.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidUrl`].
pub fn validate_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        _ => Err(DownloadError::invalid_url(url)),
    }
}

/// Checks that every configured extra header can be put on the wire.
///
/// `Range` is reserved for resume offsets and is always rejected.
///
/// # Errors
///
/// Returns [`DownloadError::InvalidHeader`] naming the first bad header.
pub fn validate_headers(headers: &BTreeMap<String, String>) -> Result<(), DownloadError> {
    headers
        .iter()
        .try_for_each(|(name, value)| parse_header(name, value).map(|_| ()))
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), DownloadError> {
    let invalid = || DownloadError::InvalidHeader {
        name: name.to_string(),
    };
    let header_name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
    if header_name == RANGE {
        return Err(invalid());
    }
    let header_value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
    Ok((header_name, header_value))
}

/// Parsed `Content-Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// `None` for the unsatisfied form `bytes */<total>`.
    pub range: Option<(u64, u64)>,
    /// `None` when the server sent `*` for the complete length.
    pub total: Option<u64>,
}

/// Parses `bytes <start>-<end>/<total>` or `bytes */<total>`; `total` may be `*`.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;

    let total = match total.trim() {
        "*" => None,
        digits => Some(digits.parse::<u64>().ok()?),
    };

    let range = match span.trim() {
        "*" => None,
        span => {
            let (start, end) = span.split_once('-')?;
            let start = start.trim().parse::<u64>().ok()?;
            let end = end.trim().parse::<u64>().ok()?;
            if end < start {
                return None;
            }
            Some((start, end))
        }
    };

    if range.is_none() && total.is_none() {
        return None;
    }
    Some(ContentRange { range, total })
}

/// Content-Range of a response, if present and well-formed.
#[must_use]
pub fn response_content_range(response: &Response) -> Option<ContentRange> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range)
}

fn response_content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Determines the full size of the resource, or 0 when unknown.
///
/// Prefers the `Content-Range` total; otherwise uses `Content-Length`, adding
/// `already_downloaded` when the response continues a partial file.
#[must_use]
pub fn derive_total_size(response: &Response, already_downloaded: u64, resumed: bool) -> u64 {
    let content_range_total = response_content_range(response).and_then(|cr| cr.total);
    total_from_headers(
        content_range_total,
        response_content_length(response),
        already_downloaded,
        resumed,
    )
}

fn total_from_headers(
    content_range_total: Option<u64>,
    content_length: Option<u64>,
    already_downloaded: u64,
    resumed: bool,
) -> u64 {
    if let Some(total) = content_range_total {
        return total;
    }
    match content_length {
        Some(remaining) if resumed => already_downloaded.saturating_add(remaining),
        Some(length) => length,
        None => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_content_range_full_form() {
        assert_eq!(
            parse_content_range("bytes 400-999/1000"),
            Some(ContentRange {
                range: Some((400, 999)),
                total: Some(1000)
            })
        );
    }

    #[test]
    fn test_parse_content_range_unknown_total() {
        assert_eq!(
            parse_content_range("bytes 0-99/*"),
            Some(ContentRange {
                range: Some((0, 99)),
                total: None
            })
        );
    }

    #[test]
    fn test_parse_content_range_unsatisfied_form() {
        assert_eq!(
            parse_content_range("bytes */1000"),
            Some(ContentRange {
                range: None,
                total: Some(1000)
            })
        );
    }

    #[test]
    fn test_parse_content_range_rejects_garbage() {
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes 9-1/10"), None);
        assert_eq!(parse_content_range("bytes */*"), None);
        assert_eq!(parse_content_range("bytes abc"), None);
    }

    #[test]
    fn test_total_prefers_content_range() {
        assert_eq!(total_from_headers(Some(1000), Some(600), 400, true), 1000);
    }

    #[test]
    fn test_total_adds_existing_bytes_when_resumed() {
        assert_eq!(total_from_headers(None, Some(600), 400, true), 1000);
        assert_eq!(total_from_headers(None, Some(600), 400, false), 600);
    }

    #[test]
    fn test_total_unknown_without_headers() {
        assert_eq!(total_from_headers(None, None, 400, true), 0);
    }

    #[test]
    fn test_validate_url_rejects_non_http() {
        assert!(validate_url("https://example.com/a.bin").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com/a.bin"),
            Err(DownloadError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_url("not-a-url"),
            Err(DownloadError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_validate_headers_rejects_bad_names() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Token".to_string(), "abc".to_string());
        assert!(validate_headers(&headers).is_ok());
        headers.insert("Bad Header".to_string(), "abc".to_string());
        assert!(matches!(
            validate_headers(&headers),
            Err(DownloadError::InvalidHeader { ref name }) if name == "Bad Header"
        ));
    }

    #[test]
    fn test_validate_headers_reserves_range() {
        let mut headers = BTreeMap::new();
        headers.insert("range".to_string(), "bytes=0-".to_string());
        assert!(matches!(
            validate_headers(&headers),
            Err(DownloadError::InvalidHeader { ref name }) if name == "range"
        ));
    }

    #[tokio::test]
    async fn test_get_sends_range_and_extra_headers() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=5-"))
            .and(header("X-Token", "secret"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 5-9/10")
                    .set_body_bytes(b"56789".to_vec()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("X-Token".to_string(), "secret".to_string());
        let url = format!("{}/file.bin", mock_server.uri());
        let response = client
            .get(&url, &headers, Some(5), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(derive_total_size(&response, 5, true), 10);
    }

    #[tokio::test]
    async fn test_get_maps_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let url = format!("{}/missing", mock_server.uri());
        let result = client
            .get(&url, &BTreeMap::new(), None, Duration::from_secs(5))
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_returns_416_only_for_range_requests() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/done"))
            .respond_with(ResponseTemplate::new(416).insert_header("Content-Range", "bytes */4"))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let url = format!("{}/done", mock_server.uri());

        let ranged = client
            .get(&url, &BTreeMap::new(), Some(4), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ranged.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response_content_range(&ranged).and_then(|cr| cr.total),
            Some(4)
        );

        let plain = client
            .get(&url, &BTreeMap::new(), None, Duration::from_secs(5))
            .await;
        assert!(matches!(
            plain,
            Err(DownloadError::HttpStatus { status: 416, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_times_out_waiting_for_response() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"data".to_vec())
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let url = format!("{}/slow", mock_server.uri());
        let result = client
            .get(&url, &BTreeMap::new(), None, Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(DownloadError::Timeout { secs: 1, .. })));
    }
}
