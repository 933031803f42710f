//! HTTP client context for a Frappe site.
//!
//! `FrappeClient` is the explicit context object the rest of the crate hangs
//! off: it owns the cookie-backed HTTP client, the resolved base URL, and the
//! shared realtime handle. Clones are cheap and observe the same session and
//! realtime connection.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::realtime::client::RealtimeClient;

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Default base address used when `FRAPPE_URL` is not set.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
/// Environment variable supplying the remote base address.
pub const BASE_URL_ENV_VAR: &str = "FRAPPE_URL";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Transport-level options applied when constructing the HTTP client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            request_timeout: ClientDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Client context for one Frappe site.
///
/// Construct once at application start and clone freely; all shared state
/// (cookie store, realtime connection) lives behind `Arc`.
#[derive(Clone)]
pub struct FrappeClient {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
    realtime: Arc<RealtimeClient>,
}

impl std::fmt::Debug for FrappeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrappeClient")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl FrappeClient {
    /// Creates a client bound to an explicit base URL.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_options(base_url, ClientOptions::default())
    }

    /// Creates a client from the `FRAPPE_URL` environment variable, falling
    /// back to [`DEFAULT_BASE_URL`].
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = env::var(BASE_URL_ENV_VAR).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url)
    }

    /// Creates a client with explicit transport options.
    ///
    /// Frappe sessions are cookie-based, so the HTTP client carries a cookie
    /// store; a successful [`login`](FrappeClient::login) leaves the session
    /// cookie there.
    pub fn with_options(base_url: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let base_url = parse_base_url(base_url)?;
        let http = Client::builder()
            .cookie_store(true)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ClientError::Transport)?;
        let realtime = Arc::new(RealtimeClient::new(realtime_endpoint(&base_url)));

        Ok(Self {
            http,
            base_url,
            request_timeout: options.request_timeout,
            realtime,
        })
    }

    /// Returns the resolved base URL without a trailing slash.
    pub fn base_url(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_string()
    }

    /// Returns the shared realtime client.
    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }

    /// Invokes a whitelisted server method via `/api/method/{method}`.
    ///
    /// Parameters are forwarded verbatim as the JSON body and the result is
    /// unwrapped from Frappe's `{"message": ...}` envelope.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<T, ClientError> {
        let body = self
            .post_json(&format!("/api/method/{method}"), params)
            .await?;
        parse_message_envelope(&body)
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub(crate) async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .get(self.endpoint(path))
            .query(query)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        check_response(response).await
    }

    pub(crate) async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        check_response(response).await
    }

    pub(crate) async fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .put(self.endpoint(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        check_response(response).await
    }

    pub(crate) async fn delete_json(&self, path: &str) -> Result<String, ClientError> {
        let response = self
            .http
            .delete(self.endpoint(path))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(ClientError::Transport)?;
        check_response(response).await
    }
}

/// Errors produced by HTTP transport and response handling.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure reported by the HTTP client.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Non-success status with an unstructured body.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Non-success status carrying a Frappe server exception.
    #[error("server exception {exc_type}: {message}")]
    ServerException {
        status: StatusCode,
        exc_type: String,
        message: String,
    },

    /// Response body did not match the expected envelope.
    #[error("failed to parse response: {0}")]
    Parse(String),

    /// Base URL was not an absolute http/https URL.
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

async fn check_response(response: Response) -> Result<String, ClientError> {
    let status = response.status();
    let body = response.text().await.map_err(ClientError::Transport)?;

    if !status.is_success() {
        if let Some((exc_type, message)) = parse_server_exception(&body) {
            return Err(ClientError::ServerException {
                status,
                exc_type,
                message,
            });
        }
        return Err(ClientError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }

    Ok(body)
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope<T> {
    message: T,
}

/// Unwraps Frappe's `{"data": ...}` resource envelope, accepting a bare
/// payload as a fallback.
pub(crate) fn parse_data_envelope<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    if let Ok(envelope) = serde_json::from_str::<DataEnvelope<T>>(body) {
        return Ok(envelope.data);
    }
    serde_json::from_str::<T>(body)
        .map_err(|err| ClientError::Parse(format!("data envelope: {err}")))
}

/// Unwraps Frappe's `{"message": ...}` method envelope, accepting a bare
/// payload as a fallback.
pub(crate) fn parse_message_envelope<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    if let Ok(envelope) = serde_json::from_str::<MessageEnvelope<T>>(body) {
        return Ok(envelope.message);
    }
    serde_json::from_str::<T>(body)
        .map_err(|err| ClientError::Parse(format!("message envelope: {err}")))
}

fn parse_server_exception(body: &str) -> Option<(String, String)> {
    #[derive(Debug, Deserialize)]
    struct ExceptionBody {
        exc_type: String,
        #[serde(default)]
        exception: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    let parsed = serde_json::from_str::<ExceptionBody>(body).ok()?;
    let message = parsed
        .exception
        .or(parsed.message)
        .unwrap_or_else(|| "unknown server exception".to_string());
    Some((parsed.exc_type, message))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        exception: Option<String>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.exception).or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

fn parse_base_url(base_url: &str) -> Result<Url, ClientError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let url =
        Url::parse(trimmed).map_err(|err| ClientError::InvalidBaseUrl(format!("{err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClientError::InvalidBaseUrl(format!(
            "unsupported scheme: {other}"
        ))),
    }
}

fn realtime_endpoint(base_url: &Url) -> String {
    let scheme = if base_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    let host = base_url.host_str().unwrap_or("localhost");
    // Sites served under a subpath keep that prefix on the websocket path.
    let prefix = base_url.path().trim_end_matches('/');
    match base_url.port() {
        Some(port) => format!("{scheme}://{host}:{port}{prefix}/ws"),
        None => format!("{scheme}://{host}{prefix}/ws"),
    }
}
