//! Replay transport for queued actions.
//!
//! `ReplayTransport` is the seam between the queue and the network. The
//! production implementation, `HttpTransport`, sends each action as a JSON
//! request with the anti-forgery token and the entry's idempotency key.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ReplayError;
use crate::storage::TokenSource;

/// Default per-attempt timeout for replay requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout used for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Header carrying the per-entry idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Longest response body excerpt kept in an error message.
const MAX_DETAIL_LEN: usize = 512;

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the server base URL:
/// - strip surrounding whitespace and trailing slashes
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Resolve an action target against the base URL. Absolute URLs pass through
/// unchanged; paths are joined to `base` with exactly one slash.
pub fn resolve_url(base: &str, target: &str) -> String {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    let base = normalize_base_url(base);
    if target.starts_with('/') {
        format!("{base}{target}")
    } else {
        format!("{base}/{target}")
    }
}

// ---------------------------------------------------------------------------
// Transport contract
// ---------------------------------------------------------------------------

/// One replay attempt, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    pub method: String,
    pub url: String,
    /// JSON-serialized payload.
    pub body: String,
    pub idempotency_key: String,
}

/// What the server answered. Any status is a response; only a missing
/// response is a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResponse {
    pub status: u16,
    pub body: String,
}

impl ReplayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends replay requests to the server.
#[async_trait]
pub trait ReplayTransport: Send + Sync {
    /// Send one request. `Err` means no response was received.
    async fn send(&self, request: &ReplayRequest) -> Result<ReplayResponse, ReplayError>;
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a readable transport failure message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach server at {url}");
    }
    if err.is_timeout() {
        return format!("Request to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid request URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Short description of an HTTP status for logs and dead-letter records.
pub fn status_error(status: u16) -> String {
    match status {
        400 => "Server rejected the action as malformed".to_string(),
        401 => "Session expired or not authenticated".to_string(),
        403 => "Action not permitted (forbidden or CSRF check failed)".to_string(),
        404 => "Action endpoint not found".to_string(),
        409 => "Action conflicts with server state".to_string(),
        429 => "Server is rate limiting requests".to_string(),
        s if s >= 500 => format!("Server error (HTTP {s})"),
        s => format!("Unexpected response from server (HTTP {s})"),
    }
}

/// Build a rejection from a non-2xx response, keeping a body excerpt for
/// diagnostics.
pub fn rejection_from_response(response: &ReplayResponse) -> ReplayError {
    let body = response.body.trim();
    let detail = if body.is_empty() {
        status_error(response.status)
    } else {
        let excerpt: String = body.chars().take(MAX_DETAIL_LEN).collect();
        format!("{}: {excerpt}", status_error(response.status))
    };
    ReplayError::ApplicationRejection {
        status: response.status,
        detail,
    }
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// reqwest-backed transport.
pub struct HttpTransport {
    client: Client,
    tokens: Arc<dyn TokenSource>,
    csrf_header: String,
}

impl HttpTransport {
    pub fn new(
        timeout: Duration,
        tokens: Arc<dyn TokenSource>,
        csrf_header: &str,
    ) -> Result<Self, String> {
        // Redirects are not followed: a 302 to a login page would otherwise
        // come back as the 200 of a GET and the action would count as synced.
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            client,
            tokens,
            csrf_header: csrf_header.to_string(),
        })
    }
}

#[async_trait]
impl ReplayTransport for HttpTransport {
    async fn send(&self, request: &ReplayRequest) -> Result<ReplayResponse, ReplayError> {
        let method: Method = request.method.parse().map_err(|_| {
            ReplayError::TransportFailure(format!("Invalid HTTP method: {}", request.method))
        })?;

        let mut req = self
            .client
            .request(method, &request.url)
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .body(request.body.clone());

        // The token is read at send time; it may rotate between retries.
        match self.tokens.csrf_token() {
            Some(token) => req = req.header(self.csrf_header.as_str(), token),
            None => debug!(url = %request.url, "No anti-forgery token available for replay"),
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ReplayError::TransportFailure(friendly_error(&request.url, &e)))?;
        let status = resp.status();
        let body = match resp.text().await {
            Ok(text) => text,
            Err(e) => {
                // The status line arrived, so the server did process the request.
                warn!(url = %request.url, error = %e, "Failed to read replay response body");
                String::new()
            }
        };

        Ok(ReplayResponse {
            status: status.as_u16(),
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Connectivity probe
// ---------------------------------------------------------------------------

/// Lightweight reachability check: any HTTP answer other than a gateway
/// error counts as online.
pub async fn check_network_status(client: &Client, probe_url: &str) -> bool {
    match client
        .head(probe_url)
        .timeout(CONNECTIVITY_TIMEOUT)
        .send()
        .await
    {
        Ok(resp) => !matches!(
            resp.status(),
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ),
        Err(e) => {
            debug!(url = probe_url, error = %e, "Connectivity probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url_adds_scheme_and_strips_slashes() {
        assert_eq!(
            normalize_base_url("pharm.example.com/"),
            "https://pharm.example.com"
        );
        assert_eq!(
            normalize_base_url("localhost:8000//"),
            "http://localhost:8000"
        );
        assert_eq!(
            normalize_base_url("  http://10.0.0.5:8000 "),
            "http://10.0.0.5:8000"
        );
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn test_resolve_url_joins_paths_and_keeps_absolute_urls() {
        let base = "https://pharm.example.com/";
        assert_eq!(
            resolve_url(base, "/store/add_to_cart/"),
            "https://pharm.example.com/store/add_to_cart/"
        );
        assert_eq!(
            resolve_url(base, "api/sync/"),
            "https://pharm.example.com/api/sync/"
        );
        assert_eq!(
            resolve_url(base, "http://other.local/api/sync/"),
            "http://other.local/api/sync/"
        );
    }

    #[test]
    fn test_rejection_keeps_status_and_truncates_body() {
        let response = ReplayResponse {
            status: 500,
            body: "x".repeat(2_000),
        };
        match rejection_from_response(&response) {
            ReplayError::ApplicationRejection { status, detail } => {
                assert_eq!(status, 500);
                assert!(detail.starts_with("Server error (HTTP 500): "));
                assert!(detail.len() < 600);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejection_without_body_uses_status_text() {
        let response = ReplayResponse {
            status: 403,
            body: "  ".into(),
        };
        assert_eq!(
            rejection_from_response(&response),
            ReplayError::ApplicationRejection {
                status: 403,
                detail: "Action not permitted (forbidden or CSRF check failed)".into(),
            }
        );
    }

    #[test]
    fn test_response_success_range() {
        let ok = |status| ReplayResponse {
            status,
            body: String::new(),
        };
        assert!(ok(200).is_success());
        assert!(ok(204).is_success());
        assert!(!ok(302).is_success());
        assert!(!ok(500).is_success());
    }

    #[tokio::test]
    async fn test_http_transport_reports_connection_refused_as_transport_failure() {
        // Bind then drop a listener to get a local port with nothing behind it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(
            Duration::from_secs(2),
            Arc::new(crate::storage::NoToken),
            "X-CSRFToken",
        )
        .unwrap();
        let request = ReplayRequest {
            method: "POST".into(),
            url: format!("http://127.0.0.1:{port}/api/sync/"),
            body: "{}".into(),
            idempotency_key: "k".into(),
        };

        let result = transport.send(&request).await;
        assert!(matches!(result, Err(ReplayError::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_http_transport_reports_redirect_instead_of_following_it() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            // Serve until the client stops connecting; a followed redirect
            // would show up as a second request.
            while let Ok(Ok((mut socket, _))) =
                tokio::time::timeout(Duration::from_millis(500), listener.accept()).await
            {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();
                let line = head.lines().next().unwrap_or_default().to_string();
                let response = if line.starts_with("POST /api/sync/") {
                    "HTTP/1.1 302 Found\r\nLocation: /login/\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                } else {
                    "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nlogin"
                };
                seen.push(line);
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
            seen
        });

        let transport = HttpTransport::new(
            Duration::from_secs(2),
            Arc::new(crate::storage::NoToken),
            "X-CSRFToken",
        )
        .unwrap();
        let request = ReplayRequest {
            method: "POST".into(),
            url: format!("http://127.0.0.1:{port}/api/sync/"),
            body: "{}".into(),
            idempotency_key: "k".into(),
        };

        let response = transport.send(&request).await.unwrap();
        assert_eq!(response.status, 302);
        assert!(!response.is_success());
        assert!(matches!(
            rejection_from_response(&response),
            ReplayError::ApplicationRejection { status: 302, .. }
        ));

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("POST /api/sync/"));
    }
}
