//! Credentialed request client for the run executor API.
//!
//! Every call borrows the bearer credential from the shared store for
//! exactly one request. A 401 triggers a single-flight refresh-and-retry:
//! concurrent failing calls queue on one shared refresh guard instead of
//! each racing their own exchange. A failed refresh clears the session
//! process-wide and surfaces `ApiError::SessionExpired`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use spyglass_client_core::{CredentialPair, CredentialStore, SessionState};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl ApiClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api_base_url_missing")]
    BaseUrlMissing,
    #[error("api_invalid_path")]
    InvalidPath,
    #[error("api_request_failed:{message}")]
    Request { message: String },
    #[error("api_read_failed:{message}")]
    Read { message: String },
    #[error("api_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("api_json_decode_failed:{message}")]
    Decode { message: String },
    #[error("session_expired")]
    SessionExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerRunRequest {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Client-chosen channel id for push delivery. The channel must be
    /// open before the trigger goes out; the accepted response carries
    /// no payload beyond the run id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRunResponse {
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One entry of the durable run event log. The tagged payload is kept
/// raw here; `spyglass-stream` owns the event model.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRunEvent {
    pub seq: i64,
    #[serde(flatten)]
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunEventPage {
    pub status: RunStatus,
    #[serde(default)]
    pub events: Vec<RawRunEvent>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct PauseResponseRequest<'a> {
    response: &'a Value,
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    refresh_gate: Arc<Mutex<()>>,
}

impl ApiClient {
    pub fn new(
        config: ApiClientConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
            store,
            refresh_gate: Arc::new(Mutex::new(())),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    #[must_use]
    pub fn runs_path() -> &'static str {
        "/v1/runs"
    }

    #[must_use]
    pub fn run_events_path(run_id: &str, after: i64) -> String {
        format!("/v1/runs/{}/events?after={after}", run_id.trim())
    }

    #[must_use]
    pub fn run_stop_path(run_id: &str) -> String {
        format!("/v1/runs/{}/stop", run_id.trim())
    }

    #[must_use]
    pub fn run_response_path(run_id: &str, node_id: &str) -> String {
        format!(
            "/v1/runs/{}/nodes/{}/response",
            run_id.trim(),
            node_id.trim()
        )
    }

    #[must_use]
    pub fn run_channel_path(channel_id: &str) -> String {
        format!("/v1/runs/{}/channel", channel_id.trim())
    }

    #[must_use]
    pub fn auth_refresh_path() -> &'static str {
        "/v1/auth/refresh"
    }

    /// Current access token, if a session is stored. Used by the push
    /// channel, which authenticates via query token rather than header.
    #[must_use]
    pub fn bearer_token(&self) -> Option<String> {
        self.current_access_token()
    }

    /// Trigger a run. Fire-and-forget: the executor accepts immediately
    /// and all progress arrives via push or poll delivery.
    pub async fn trigger_run(
        &self,
        request: &TriggerRunRequest,
    ) -> Result<TriggerRunResponse, ApiError> {
        self.request_json(Method::POST, Self::runs_path(), Some(request))
            .await
    }

    /// Best-effort cancellation of a running job.
    pub async fn stop_run(&self, run_id: &str) -> Result<(), ApiError> {
        self.request_empty(Method::POST, Self::run_stop_path(run_id).as_str())
            .await
    }

    /// List events after the given cursor (`-1` replays from the start).
    pub async fn list_run_events(
        &self,
        run_id: &str,
        after: i64,
    ) -> Result<RunEventPage, ApiError> {
        self.request_json::<Value, _>(
            Method::GET,
            Self::run_events_path(run_id, after).as_str(),
            None,
        )
        .await
    }

    /// Submit a human response for a paused node; the executor resumes
    /// the run on success.
    pub async fn respond_to_pause(
        &self,
        run_id: &str,
        node_id: &str,
        response: &Value,
    ) -> Result<(), ApiError> {
        self.request_empty_with_body(
            Method::POST,
            Self::run_response_path(run_id, node_id).as_str(),
            &PauseResponseRequest { response },
        )
        .await
    }

    /// Exchange the stored refresh token for a new credential pair and
    /// persist it. Public for explicit session renewal; the 401 path
    /// goes through the same single-flight gate.
    pub async fn refresh_session(&self) -> Result<CredentialPair, ApiError> {
        let stale = self.current_access_token();
        self.refresh_and_rotate(stale.as_deref()).await
    }

    async fn request_json<Req, Res>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Req>,
    ) -> Result<Res, ApiError>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send_authorized(method, path, payload).await?;
        decode_json_response(response).await
    }

    async fn request_empty(&self, method: Method, path: &str) -> Result<(), ApiError> {
        let response = self.send_authorized::<Value>(method, path, None).await?;
        decode_empty_response(response).await
    }

    async fn request_empty_with_body<Req>(
        &self,
        method: Method,
        path: &str,
        payload: &Req,
    ) -> Result<(), ApiError>
    where
        Req: Serialize + ?Sized,
    {
        let response = self.send_authorized(method, path, Some(payload)).await?;
        decode_empty_response(response).await
    }

    async fn send_authorized<Req>(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Req>,
    ) -> Result<reqwest::Response, ApiError>
    where
        Req: Serialize + ?Sized,
    {
        let url = self.endpoint(path).ok_or(ApiError::InvalidPath)?;
        let access = self.current_access_token();
        let response = self
            .send_once(method.clone(), &url, payload, access.as_deref())
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED || access.is_none() {
            return Ok(response);
        }

        debug!(%url, "authorized call returned 401; attempting refresh");
        let rotated = self.refresh_and_rotate(access.as_deref()).await?;
        let retried = self
            .send_once(method, &url, payload, Some(rotated.access_token.as_str()))
            .await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(%url, "retried call rejected after refresh; clearing session");
            if let Err(error) = self.store.clear_session() {
                warn!(%error, "session clear failed after rejected retry");
            }
            return Err(ApiError::SessionExpired);
        }
        Ok(retried)
    }

    async fn send_once<Req>(
        &self,
        method: Method,
        url: &str,
        payload: Option<&Req>,
        access_token: Option<&str>,
    ) -> Result<reqwest::Response, ApiError>
    where
        Req: Serialize + ?Sized,
    {
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let mut request = self
                .http
                .request(method.clone(), url)
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);
            if let Some(token) = access_token {
                request = request.bearer_auth(token);
            }
            if let Some(payload) = payload {
                request = request.json(payload);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(ApiError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Single-flight refresh. Concurrent 401s queue on the gate; after
    /// acquiring it, a caller re-reads the store and joins a rotation
    /// that already happened instead of spending the refresh token again.
    async fn refresh_and_rotate(
        &self,
        stale_access: Option<&str>,
    ) -> Result<CredentialPair, ApiError> {
        let _guard = self.refresh_gate.lock().await;

        let session = match self.store.load_session() {
            Ok(Some(session)) => session,
            Ok(None) => return Err(ApiError::SessionExpired),
            Err(error) => {
                warn!(%error, "session load failed during refresh");
                return Err(ApiError::SessionExpired);
            }
        };
        if let Some(stale_access) = stale_access
            && session.credentials.access_token != stale_access
        {
            return Ok(session.credentials);
        }

        match self
            .exchange_refresh_token(&session.credentials.refresh_token)
            .await
        {
            Ok(rotated) => {
                let next = SessionState {
                    credentials: rotated.clone(),
                    ..session
                };
                if let Err(error) = self.store.persist_session(&next) {
                    warn!(%error, "rotated credential persist failed");
                }
                Ok(rotated)
            }
            Err(error) => {
                warn!(%error, "refresh exchange failed; clearing session");
                if let Err(clear_error) = self.store.clear_session() {
                    warn!(error = %clear_error, "session clear failed after refresh failure");
                }
                Err(ApiError::SessionExpired)
            }
        }
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<CredentialPair, ApiError> {
        let url = self
            .endpoint(Self::auth_refresh_path())
            .ok_or(ApiError::InvalidPath)?;
        let response = self
            .send_once(
                Method::POST,
                &url,
                Some(&RefreshRequest { refresh_token }),
                None,
            )
            .await?;
        let rotated: RefreshResponse = decode_json_response(response).await?;
        Ok(CredentialPair {
            access_token: rotated.access_token,
            refresh_token: rotated.refresh_token,
        })
    }

    fn current_access_token(&self) -> Option<String> {
        match self.store.load_session() {
            Ok(session) => session.map(|state| state.credentials.access_token),
            Err(error) => {
                warn!(%error, "session load failed; sending unauthenticated");
                None
            }
        }
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> ApiError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    ApiError::Http { status, body }
}

fn normalize_base_url(base_url: &str) -> Result<String, ApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, ApiError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response.bytes().await.map_err(|error| ApiError::Read {
        message: error.to_string(),
    })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| ApiError::Decode {
        message: error.to_string(),
    })
}

async fn decode_empty_response(response: reqwest::Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let bytes = response.bytes().await.map_err(|error| ApiError::Read {
        message: error.to_string(),
    })?;
    Err(format_http_error(status, &bytes))
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
