//! Request-scoped emergency markers
//!
//! Set by the override gate, read by handlers, consent middleware, and the
//! audit hand-off.

use axum::http::Extensions;
use serde::Serialize;

/// Emergency flag and justification attached to one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmergencyContext {
    pub active: bool,
    pub reason: Option<String>,
}

impl EmergencyContext {
    pub fn active(reason: impl Into<String>) -> Self {
        Self {
            active: true,
            reason: Some(reason.into()),
        }
    }

    /// Context of a request; inactive when the gate did not fire
    pub fn of(extensions: &Extensions) -> Self {
        extensions.get::<Self>().cloned().unwrap_or_default()
    }
}

/// Instruction to downstream consent checks to skip this request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsentBypass;

/// Whether consent checks must be skipped for this request
pub fn consent_bypassed(extensions: &Extensions) -> bool {
    extensions.get::<ConsentBypass>().is_some()
}
