//! Gate Error Types
//!
//! Errors produced by admission, break-glass, and admin operations, and how
//! each renders as an HTTP response.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Quota window a denial was charged against
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Window::Minute => write!(f, "minute"),
            Window::Hour => write!(f, "hour"),
            Window::Day => write!(f, "day"),
        }
    }
}

/// Error types for gate operations
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Windowed quota exhausted
    #[error("Rate limit exceeded: {limit} requests per {window}")]
    QuotaExceeded {
        window: Window,
        limit: u64,
        retry_after_secs: u64,
    },

    /// Too many in-flight requests
    #[error("Concurrency limit exceeded: {limit} in-flight requests")]
    ConcurrencyExceeded { limit: u64 },

    /// Unknown plan name (admin callers only)
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    /// Plan upsert without a name
    #[error("Plan name is required")]
    PlanNameRequired,

    /// Break-glass requested without an authenticated identity
    #[error("Break-glass override requires an authenticated user")]
    UnauthenticatedOverride,

    /// Break-glass hourly cap reached
    #[error("Break-glass rate limit exceeded: maximum {max_per_hour} overrides per hour")]
    BreakGlassRateLimited {
        max_per_hour: u32,
        retry_after_secs: u64,
    },
}

impl GateError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            GateError::QuotaExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GateError::ConcurrencyExceeded { .. } => "CONCURRENCY_LIMIT_EXCEEDED",
            GateError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            GateError::PlanNameRequired => "PLAN_NAME_REQUIRED",
            GateError::UnauthenticatedOverride => "BREAK_GLASS_UNAUTHENTICATED",
            GateError::BreakGlassRateLimited { .. } => "BREAK_GLASS_RATE_LIMITED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GateError::QuotaExceeded { .. }
            | GateError::ConcurrencyExceeded { .. }
            | GateError::BreakGlassRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::PlanNotFound(_) => StatusCode::NOT_FOUND,
            GateError::PlanNameRequired => StatusCode::BAD_REQUEST,
            GateError::UnauthenticatedOverride => StatusCode::UNAUTHORIZED,
        }
    }

    /// Seconds the caller should wait, for denials that carry one
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GateError::QuotaExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            GateError::ConcurrencyExceeded { .. } => Some(1),
            GateError::BreakGlassRateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
        });

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
