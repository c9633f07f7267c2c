use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8090";
pub const ENV_API_BASE_URL: &str = "SPYGLASS_API_BASE_URL";
pub const API_BASE_SOURCE_STORED_SESSION: &str = "stored_session";
pub const API_BASE_SOURCE_DEFAULT_LOCAL: &str = "default_local";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthInputError {
    #[error("base url must not be empty")]
    EmptyBaseUrl,
    #[error("base url must use http:// or https:// and include a host")]
    InvalidBaseUrl,
}

/// Access/refresh token pair. A refresh exchanges both atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub base_url: String,
    pub credentials: CredentialPair,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApiBaseUrl {
    pub base_url: String,
    pub source: String,
    pub locked_by_env: bool,
}

/// Resolve the API base URL: env override, then the stored session's
/// base URL, then the local default.
pub fn resolve_api_base_url(
    stored_session_base_url: Option<&str>,
) -> Result<ResolvedApiBaseUrl, AuthInputError> {
    if let Some(base_url) = env_non_empty(ENV_API_BASE_URL) {
        return Ok(ResolvedApiBaseUrl {
            base_url: normalize_base_url(&base_url)?,
            source: ENV_API_BASE_URL.to_string(),
            locked_by_env: true,
        });
    }

    if let Some(base_url) = stored_session_base_url
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
    {
        return Ok(ResolvedApiBaseUrl {
            base_url: normalize_base_url(base_url)?,
            source: API_BASE_SOURCE_STORED_SESSION.to_string(),
            locked_by_env: false,
        });
    }

    Ok(ResolvedApiBaseUrl {
        base_url: normalize_base_url(DEFAULT_API_BASE_URL)?,
        source: API_BASE_SOURCE_DEFAULT_LOCAL.to_string(),
        locked_by_env: false,
    })
}

pub fn normalize_base_url(raw: &str) -> Result<String, AuthInputError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AuthInputError::EmptyBaseUrl);
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    let Some((_, remainder)) = trimmed.split_once("://") else {
        return Err(AuthInputError::InvalidBaseUrl);
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(AuthInputError::InvalidBaseUrl);
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
}
