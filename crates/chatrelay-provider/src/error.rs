use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    ServerError,
    AuthError,
    InvalidRequest,
    NotFound,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            404 => Self::NotFound,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError)
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rate limited: {message}")]
    RateLimited { message: String },
    #[error("backend rejected credentials: {message}")]
    Auth { message: String },
    #[error("backend request timed out")]
    Timeout,
    #[error("backend connection failed: {0}")]
    Connect(String),
    #[error("backend api error ({status}): {message}")]
    Api {
        status: u16,
        kind: ErrorKind,
        message: String,
    },
    #[error("unexpected backend response: {0}")]
    Decode(String),
    #[error("invalid backend configuration: {0}")]
    Config(String),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn from_response(status: StatusCode, body: &str) -> Self {
        let kind = ErrorKind::from_status(status);
        let message = match serde_json::from_str::<ApiErrorEnvelope>(body) {
            Ok(envelope) if envelope.error.r#type.is_empty() => envelope.error.message,
            Ok(envelope) => format!("{} ({})", envelope.error.message, envelope.error.r#type),
            Err(_) if body.trim().is_empty() => status.to_string(),
            Err(_) => body.trim().chars().take(200).collect(),
        };
        match kind {
            ErrorKind::RateLimit => Self::RateLimited { message },
            ErrorKind::AuthError => Self::Auth { message },
            _ => Self::Api {
                status: status.as_u16(),
                kind,
                message,
            },
        }
    }

    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Connect(err.to_string())
        }
    }

    /// Errors worth telling the user about in plain words; the turn may
    /// succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Auth { .. } | Self::Timeout | Self::Connect(_) => true,
            Self::Api { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "AI backend error - rate limited, please try again later",
            Self::Auth { .. } => "AI backend error - authentication failed",
            Self::Timeout => "AI backend error - response timed out",
            Self::Connect(_) => "AI backend error - could not connect",
            Self::Api { .. } if self.is_transient() => "AI backend error - service unavailable",
            _ => "AI backend error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub message: String,
}
