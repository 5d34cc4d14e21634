//! Admission Gate
//!
//! axum middleware that charges each request against its identity's plan and
//! holds a concurrency slot for as long as the handler runs.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::identity::resolve_identity;
use crate::quota::{AdmissionInfo, ClientQuotaTracker};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Concurrency slot returned to the tracker when dropped
///
/// Dropping covers normal return, error responses, panics unwinding through
/// the handler, and the request future being cancelled.
#[derive(Debug)]
pub struct AdmissionSlot {
    tracker: Arc<ClientQuotaTracker>,
    identity: String,
}

impl AdmissionSlot {
    pub fn new(tracker: Arc<ClientQuotaTracker>, identity: String) -> Self {
        Self { tracker, identity }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.tracker.release(&self.identity);
    }
}

/// Admission middleware
///
/// Use with `axum::middleware::from_fn_with_state(tracker, admission_gate)`.
pub async fn admission_gate(
    State(tracker): State<Arc<ClientQuotaTracker>>,
    request: Request,
    next: Next,
) -> Response {
    let identity = resolve_identity(request.headers(), request.extensions());
    let info = tracker.allow(&identity);
    let reset_epoch = reset_epoch(&info);

    if let Some(error) = info.to_error() {
        let mut response = error.into_response();
        apply_rate_limit_headers(response.headers_mut(), &info, reset_epoch);
        return response;
    }

    let _slot = AdmissionSlot::new(Arc::clone(&tracker), identity);
    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &info, reset_epoch);
    response
}

/// Epoch seconds at which the minute window rolls over
fn reset_epoch(info: &AdmissionInfo) -> i64 {
    let reset_in = info.minute_reset_in;
    let secs = reset_in.as_secs() + u64::from(reset_in.subsec_nanos() > 0);
    chrono::Utc::now().timestamp() + i64::try_from(secs).unwrap_or(i64::MAX / 2)
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, info: &AdmissionInfo, reset_epoch: i64) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_epoch));
}
