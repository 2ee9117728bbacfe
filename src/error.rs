use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the request executor, the token coordinator and the client.
///
/// Only `Transport`, `Status`, `MissingCredential` and the request-building
/// variants reach callers of `KeepaClient::fetch` in normal operation.
/// `RateLimited` is absorbed by the retry loop unless rate limiting is switched
/// off, and `ResponseParse` is only ever logged by the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("access key is required but not set")]
    MissingCredential,

    #[error("failed to build URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("base URL cannot carry an endpoint path: {0}")]
    InvalidBaseUrl(String),

    #[error("invalid User-Agent header: {0}")]
    InvalidUserAgent(#[from] reqwest::header::InvalidHeaderValue),

    #[error("failed to marshal JSON body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error: status code {}", .status.as_u16())]
    Status { status: StatusCode, body: String },

    #[error("HTTP error: status code 429 (Too Many Requests)")]
    RateLimited { body: Vec<u8> },

    #[error("rate limited {attempts} times in a row, giving up")]
    PersistentRejection { attempts: u32 },

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("failed to parse response: {0}")]
    ResponseParse(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::PersistentRejection { .. }
        )
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::RateLimited { .. } | Error::PersistentRejection { .. } => {
                Some(StatusCode::TOO_MANY_REQUESTS)
            }
            Error::Transport(e) => e.status(),
            _ => None,
        }
    }

    /// Stable, machine-friendly code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingCredential => "missing_credential",
            Error::Url(_) | Error::InvalidBaseUrl(_) | Error::InvalidUserAgent(_) => {
                "invalid_request"
            }
            Error::Encode(_) => "invalid_body",
            Error::Transport(_) => "transport_error",
            Error::Status { status, .. } => status_code(*status),
            Error::RateLimited { .. } | Error::PersistentRejection { .. } => "rate_limited",
            Error::Cancelled => "cancelled",
            Error::ResponseParse(_) => "invalid_response",
        }
    }
}

pub fn status_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad_request",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::PAYMENT_REQUIRED => "payment_required",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "not_found",
        StatusCode::METHOD_NOT_ALLOWED => "method_not_allowed",
        StatusCode::TOO_MANY_REQUESTS => "rate_limited",
        s if s.is_server_error() => "upstream_error",
        _ => "server_error",
    }
}
