//! Error sanitizer
//!
//! The one place internal failure detail becomes a caller-visible body.
//! Production mode returns a generic message per category; verbose mode adds
//! the internal detail in `details`. DNS and resolved-IP failures share one
//! generic message so callers cannot map internal topology, while size
//! errors always name the numeric limit.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::media::{ErrorCategory, FetchError};

/// JSON error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
            retry_after: None,
        }
    }
}

/// Sanitizer mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorPolicy {
    pub verbose: bool,
}

impl ErrorPolicy {
    pub fn production() -> Self {
        Self { verbose: false }
    }

    pub fn verbose() -> Self {
        Self { verbose: true }
    }

    /// Caller-visible body for a fetch failure.
    pub fn body_for(&self, err: &FetchError) -> ErrorBody {
        let error = match err {
            FetchError::TooLarge { limit } => {
                format!("Image exceeds maximum size of {limit} bytes")
            }
            other => generic_message(other.category()).to_string(),
        };

        ErrorBody {
            error,
            details: self.verbose.then(|| err.to_string()),
            retry_after: None,
        }
    }

    pub fn response_for(&self, err: &FetchError) -> Response {
        json_error(err.status_code(), self.body_for(err))
    }

    /// 429 with `Retry-After` and `retryAfter`.
    pub fn rate_limited(&self, retry_after_secs: u64) -> Response {
        let mut body = ErrorBody::new(generic_message(ErrorCategory::RateLimited));
        body.retry_after = Some(retry_after_secs);
        let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, body);
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }

    /// Error for request-shape problems that never reach the fetcher.
    pub fn request_error(&self, status: StatusCode, message: &str, detail: Option<String>) -> Response {
        let mut body = ErrorBody::new(message);
        if self.verbose {
            body.details = detail;
        }
        json_error(status, body)
    }
}

fn generic_message(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::InvalidUrl => "Invalid URL",
        ErrorCategory::ForbiddenUrl => "URL not allowed",
        // Same text for both so a caller cannot tell a private answer from NXDOMAIN
        ErrorCategory::DnsFailure | ErrorCategory::ForbiddenResolvedIp => {
            "URL host could not be resolved to an allowed address"
        }
        ErrorCategory::TooManyRedirects => "Too many redirects",
        ErrorCategory::MissingRedirectLocation => "Invalid redirect from upstream",
        ErrorCategory::UpstreamStatus => "Upstream server returned an error",
        ErrorCategory::Upstream => "Failed to fetch image",
        ErrorCategory::ContentTypeRejected => "Upstream content is not a supported image type",
        ErrorCategory::SignatureRejected => "Upstream content is not a valid image",
        ErrorCategory::TooSmall => "Upstream content is too small to be an image",
        ErrorCategory::TooLarge => "Image too large",
        ErrorCategory::Timeout => "Upstream request timed out",
        ErrorCategory::RateLimited => "Too many requests",
    }
}

fn json_error(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}
