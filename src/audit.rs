//! Audit Hand-off
//!
//! After the handler runs, the surrounding logging layer hands each request's
//! emergency flag and reason to an [`AuditSink`]. Persisting the record is the
//! sink's concern; the bundled [`TracingAuditSink`] only logs it.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

use crate::break_glass::EmergencyContext;
use crate::middleware::identity::Principal;

/// One audited request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub user: Option<String>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub emergency: bool,
    pub emergency_reason: Option<String>,
    /// Reason given for an override the gate refused
    pub refused_override_reason: Option<String>,
}

/// Receiver of audit records
pub trait AuditSink: Send + Sync + Debug {
    fn record(&self, record: AuditRecord);
}

/// Sink that writes records to the `audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        info!(
            target: "audit",
            user = record.user.as_deref().unwrap_or("-"),
            method = %record.method,
            path = %record.path,
            status = record.status,
            emergency = record.emergency,
            emergency_reason = record.emergency_reason.as_deref().unwrap_or(""),
            refused_override_reason = record.refused_override_reason.as_deref().unwrap_or(""),
            "request audited"
        );
    }
}

/// Audit middleware; layer it outside the override gate
pub async fn audit_trail(
    State(sink): State<Arc<dyn AuditSink>>,
    mut request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    // Extensions do not travel back with the response. Capturing here first
    // keeps the user on requests that never reach the handler.
    let slot = AuditSlot::default();
    slot.capture(request.extensions());
    request.extensions_mut().insert(slot.clone());

    let response = next.run(request).await;

    let capture = slot.take();
    sink.record(AuditRecord {
        timestamp: chrono::Utc::now(),
        user: capture.user,
        method,
        path,
        status: response.status().as_u16(),
        emergency: capture.context.active,
        emergency_reason: capture.context.reason,
        refused_override_reason: capture.refused_override,
    });

    response
}

/// State gathered for one request while it passes through the layers
#[derive(Debug, Clone, Default)]
struct AuditCapture {
    user: Option<String>,
    context: EmergencyContext,
    refused_override: Option<String>,
}

/// Shared cell the inner layers fill with the request's state
#[derive(Debug, Clone, Default)]
pub struct AuditSlot(Arc<std::sync::Mutex<AuditCapture>>);

impl AuditSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, AuditCapture> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Capture identity and emergency context from the request extensions
    ///
    /// A later capture replaces the context; the user is kept when the later
    /// request carries no [`Principal`].
    pub fn capture(&self, extensions: &axum::http::Extensions) {
        let user = extensions.get::<Principal>().map(|p| p.subject.clone());
        let mut cell = self.lock();
        if user.is_some() {
            cell.user = user;
        }
        cell.context = EmergencyContext::of(extensions);
    }

    /// Note an override the gate refused, with the reason it was asked for
    pub fn note_refused_override(&self, reason: &str) {
        self.lock().refused_override = Some(reason.to_string());
    }

    fn take(&self) -> AuditCapture {
        std::mem::take(&mut *self.lock())
    }
}

/// Innermost middleware that fills the [`AuditSlot`]
pub async fn capture_audit_context(request: Request, next: Next) -> Response {
    if let Some(slot) = request.extensions().get::<AuditSlot>() {
        slot.capture(request.extensions());
    }
    next.run(request).await
}
