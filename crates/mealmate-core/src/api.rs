// REST client for the mealmate API.
//
// Every response is wrapped in a `{ message, data, detail? }` envelope.
// A non-2xx response gets one transparent retry after a successful session
// refresh; whatever the retry returns is surfaced as a classified `ApiError`.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ApiConfig, CredentialsConfig};
use crate::protocol::{
    Agreement, ConsentRequest, MeetingLiveState, MessagePage, PreferenceRequest, Profile,
    ReadCursorRequest,
};
use crate::settlement::SettlementState;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const CSRF_COOKIE: &str = "XSRF-TOKEN";
const CSRF_HEADER: &str = "X-XSRF-TOKEN";

const CSRF_PATH: &str = "/api/auth/csrf";
const REFRESH_PATH: &str = "/api/auth/refresh";
const LOGOUT_PATH: &str = "/api/auth/logout";
const ME_PATH: &str = "/api/users/me";
const PREFERENCES_PATH: &str = "/api/users/me/preferences";
const AGREEMENTS_PATH: &str = "/api/agreements";
const CONSENT_PATH: &str = "/api/agreements/consent";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    /// 401 or 403 that a session refresh could not resolve.
    #[error("not authorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("request failed with status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        detail: Option<String>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response for {path} carried no data")]
    MissingData { path: String },

    #[error("invalid request path {path}")]
    InvalidPath { path: String },
}

impl ApiError {
    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized { status, .. } | ApiError::Status { status, .. } => {
                Some(*status)
            }
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    /// The server answered with a non-2xx status.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. } | ApiError::Status { .. })
    }

    /// True when `code` appears (case-insensitively) in the error's message
    /// or detail text. The server has no typed error channel, so recoverable
    /// domain errors are recognized by the code embedded in that text.
    pub fn has_code(&self, code: &str) -> bool {
        let needle = code.to_lowercase();
        let contains = |text: &str| text.to_lowercase().contains(&needle);
        match self {
            ApiError::Unauthorized { message, .. } => contains(message),
            ApiError::Status {
                message, detail, ..
            } => contains(message) || detail.as_deref().is_some_and(contains),
            other => contains(&other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    detail: Option<Value>,
}

/// Interpret a raw response. Success yields the envelope's `data` (`None`
/// for 204, an empty body, or a null `data`); failure yields a classified
/// error carrying the envelope's message and detail when present.
pub(crate) fn parse_response(status: StatusCode, body: &str) -> Result<Option<Value>, ApiError> {
    let trimmed = body.trim();

    if status.is_success() {
        if status == StatusCode::NO_CONTENT || trimmed.is_empty() {
            return Ok(None);
        }
        let envelope: Envelope = serde_json::from_str(trimmed)?;
        return Ok(envelope.data.filter(|v| !v.is_null()));
    }

    let (message, detail) = match serde_json::from_str::<Envelope>(trimmed) {
        Ok(envelope) => (
            envelope.message.unwrap_or_default(),
            envelope.detail.map(detail_text),
        ),
        Err(_) => (trimmed.to_string(), None),
    };

    let code = status.as_u16();
    if code == 401 || code == 403 {
        Err(ApiError::Unauthorized {
            status: code,
            message,
        })
    } else {
        Err(ApiError::Status {
            status: code,
            message,
            detail,
        })
    }
}

fn detail_text(detail: Value) -> String {
    match detail {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Pull one cookie's value out of a `Cookie:` header string.
pub(crate) fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// API seams
// ---------------------------------------------------------------------------

/// Account and onboarding endpoints.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Ask the server to set the CSRF cookie. Best effort.
    async fn prime_csrf(&self) -> Result<(), ApiError>;
    async fn fetch_profile(&self) -> Result<Profile, ApiError>;
    async fn logout(&self) -> Result<(), ApiError>;
    async fn withdraw(&self) -> Result<(), ApiError>;
    async fn list_agreements(&self) -> Result<Vec<Agreement>, ApiError>;
    async fn consent_agreements(&self, agreement_ids: &[u64]) -> Result<(), ApiError>;
    async fn save_preferences(&self, choice_ids: &[u64]) -> Result<(), ApiError>;
}

#[async_trait]
pub trait SettlementApi: Send + Sync {
    async fn fetch_settlement_state(&self, meeting_id: u64) -> Result<SettlementState, ApiError>;
    async fn start_ocr(&self, meeting_id: u64) -> Result<(), ApiError>;
}

#[async_trait]
pub trait MeetingApi: Send + Sync {
    async fn fetch_live_state(&self, meeting_id: u64) -> Result<MeetingLiveState, ApiError>;
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Fetch up to `size` messages older than `cursor` (newest when `None`),
    /// newest first.
    async fn fetch_messages(
        &self,
        meeting_id: u64,
        cursor: Option<u64>,
        size: u32,
    ) -> Result<MessagePage, ApiError>;

    async fn update_read_cursor(&self, meeting_id: u64, last_read_id: u64)
        -> Result<(), ApiError>;
}

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

/// reqwest-backed implementation of every API seam.
///
/// Cookies (session and CSRF) live in a shared jar so the WebSocket
/// handshake can reuse them through [`ApiClient::cookie_header`]. Clones
/// share the connection pool and the cookie jar.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    jar: Arc<Jar>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, credentials: &CredentialsConfig) -> Result<Self, ApiError> {
        let base_url = Url::parse(&config.base_url).map_err(|_| ApiError::InvalidPath {
            path: config.base_url.clone(),
        })?;

        let jar = Arc::new(Jar::default());
        if let Some(cookie) = credentials.session_cookie.as_deref() {
            jar.add_cookie_str(cookie, &base_url);
            debug!("Imported session cookie from credentials");
        }

        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(config.timeout())
            .build()?;

        Ok(ApiClient {
            http,
            base_url,
            jar,
        })
    }

    /// Current `Cookie:` header value for the API origin.
    pub fn cookie_header(&self) -> Option<String> {
        self.jar
            .cookies(&self.base_url)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    fn csrf_token(&self) -> Option<String> {
        self.cookie_header()
            .and_then(|header| cookie_value(&header, CSRF_COOKIE))
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url.join(path).map_err(|_| ApiError::InvalidPath {
            path: path.to_string(),
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, ApiError> {
        let mut request = self.http.request(method.clone(), self.url(path)?);
        if is_mutating(method) {
            if let Some(token) = self.csrf_token() {
                request = request.header(CSRF_HEADER, token);
            }
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!(%method, path, status = status.as_u16(), "API response");
        parse_response(status, &text)
    }

    async fn refresh_session(&self) -> Result<(), ApiError> {
        self.send_once(&Method::POST, REFRESH_PATH, None).await?;
        Ok(())
    }

    /// Send a request. A non-2xx answer triggers one session refresh; if the
    /// refresh succeeds the request is sent again and that result stands,
    /// otherwise the first error is returned. Network and decode failures are
    /// not retried.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>, ApiError> {
        match self.send_once(&method, path, body.as_ref()).await {
            Err(err) if err.is_rejection() => match self.refresh_session().await {
                Ok(()) => {
                    info!(path, status = ?err.status(), "Session refreshed, retrying request");
                    self.send_once(&method, path, body.as_ref()).await
                }
                Err(refresh_err) => {
                    debug!(path, "Session refresh failed: {}", refresh_err);
                    Err(err)
                }
            },
            other => other,
        }
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        match self.request(Method::GET, path, None).await? {
            Some(value) => decode(value),
            None => Err(ApiError::MissingData {
                path: path.to_string(),
            }),
        }
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Option<Value>, ApiError> {
        let value = serde_json::to_value(body)?;
        self.request(method, path, Some(value)).await
    }
}

#[async_trait]
impl SessionApi for ApiClient {
    async fn prime_csrf(&self) -> Result<(), ApiError> {
        self.send_once(&Method::GET, CSRF_PATH, None).await?;
        Ok(())
    }

    async fn fetch_profile(&self) -> Result<Profile, ApiError> {
        self.get_data(ME_PATH).await
    }

    async fn logout(&self) -> Result<(), ApiError> {
        self.request(Method::POST, LOGOUT_PATH, None).await?;
        Ok(())
    }

    async fn withdraw(&self) -> Result<(), ApiError> {
        self.request(Method::DELETE, ME_PATH, None).await?;
        Ok(())
    }

    async fn list_agreements(&self) -> Result<Vec<Agreement>, ApiError> {
        self.get_data(AGREEMENTS_PATH).await
    }

    async fn consent_agreements(&self, agreement_ids: &[u64]) -> Result<(), ApiError> {
        self.send_json(Method::POST, CONSENT_PATH, &ConsentRequest { agreement_ids })
            .await?;
        Ok(())
    }

    async fn save_preferences(&self, choice_ids: &[u64]) -> Result<(), ApiError> {
        self.send_json(Method::POST, PREFERENCES_PATH, &PreferenceRequest { choice_ids })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SettlementApi for ApiClient {
    async fn fetch_settlement_state(&self, meeting_id: u64) -> Result<SettlementState, ApiError> {
        self.get_data(&format!("/api/meetings/{meeting_id}/settlement/state"))
            .await
    }

    async fn start_ocr(&self, meeting_id: u64) -> Result<(), ApiError> {
        self.request(
            Method::POST,
            &format!("/api/meetings/{meeting_id}/settlement/ocr"),
            None,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MeetingApi for ApiClient {
    async fn fetch_live_state(&self, meeting_id: u64) -> Result<MeetingLiveState, ApiError> {
        self.get_data(&format!("/api/meetings/{meeting_id}/state"))
            .await
    }
}

#[async_trait]
impl ChatApi for ApiClient {
    async fn fetch_messages(
        &self,
        meeting_id: u64,
        cursor: Option<u64>,
        size: u32,
    ) -> Result<MessagePage, ApiError> {
        let path = match cursor {
            Some(cursor) => {
                format!("/api/meetings/{meeting_id}/chat/messages?cursor={cursor}&size={size}")
            }
            None => format!("/api/meetings/{meeting_id}/chat/messages?size={size}"),
        };
        self.get_data(&path).await
    }

    async fn update_read_cursor(
        &self,
        meeting_id: u64,
        last_read_id: u64,
    ) -> Result<(), ApiError> {
        let path = format!("/api/meetings/{meeting_id}/chat/read");
        let body = ReadCursorRequest {
            last_read_message_id: last_read_id,
        };
        if let Err(e) = self.send_json(Method::PUT, &path, &body).await {
            warn!(meeting_id, last_read_id, "Read cursor update failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
