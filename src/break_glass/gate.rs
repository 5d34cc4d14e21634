//! Emergency Override Gate
//!
//! axum middleware for break-glass requests. A request on a governed path
//! that carries a non-blank override reason must come from an authenticated
//! principal and fit under the hourly cap; it then runs with the admin role,
//! a consent bypass, and an [`EmergencyContext`] attached.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

use super::context::{ConsentBypass, EmergencyContext};
use super::limiter::{BreakGlassLimiter, DEFAULT_MAX_PER_HOUR};
use crate::audit::AuditSlot;
use crate::clock::{Clock, SystemClock};
use crate::error::GateError;
use crate::quota::counter::secs_until;
use crate::metrics;
use crate::middleware::identity::{network_origin, Principal, ADMIN_ROLE};

/// Header carrying the free-text justification
pub const BREAK_GLASS_HEADER: &str = "x-break-glass-reason";

/// Which requests are governed and how many overrides are allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakGlassPolicy {
    /// Overrides per identity per rolling hour
    pub max_per_hour: u32,

    /// Path prefixes of clinical resources
    pub governed_prefixes: Vec<String>,

    /// Header carrying the override reason
    pub header: String,
}

impl Default for BreakGlassPolicy {
    fn default() -> Self {
        Self {
            max_per_hour: DEFAULT_MAX_PER_HOUR,
            governed_prefixes: vec!["/fhir/".to_string()],
            header: BREAK_GLASS_HEADER.to_string(),
        }
    }
}

impl BreakGlassPolicy {
    pub fn governs(&self, path: &str) -> bool {
        self.governed_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Shared state of the override middleware
#[derive(Debug)]
pub struct BreakGlassGate {
    limiter: Arc<BreakGlassLimiter>,
    clock: Arc<dyn Clock>,
    policy: BreakGlassPolicy,
}

impl BreakGlassGate {
    pub fn new(limiter: Arc<BreakGlassLimiter>, policy: BreakGlassPolicy) -> Self {
        Self::with_clock(limiter, policy, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        limiter: Arc<BreakGlassLimiter>,
        policy: BreakGlassPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiter,
            clock,
            policy,
        }
    }

    pub fn limiter(&self) -> &Arc<BreakGlassLimiter> {
        &self.limiter
    }

    pub fn policy(&self) -> &BreakGlassPolicy {
        &self.policy
    }

    /// Override reason, if this request asks for one
    fn requested_reason(&self, request: &Request) -> Option<String> {
        if !self.policy.governs(request.uri().path()) {
            return None;
        }

        request
            .headers()
            .get(self.policy.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_string)
    }

    /// Apply the override to `request` when one is requested
    ///
    /// Returns `Ok(false)` when the request passes through untouched.
    pub fn apply(&self, request: &mut Request) -> Result<bool, GateError> {
        let Some(reason) = self.requested_reason(request) else {
            return Ok(false);
        };

        let Some(mut principal) = request.extensions().get::<Principal>().cloned() else {
            warn!(
                target: "break_glass",
                path = %request.uri().path(),
                method = %request.method(),
                "Break-glass requested without an authenticated user"
            );
            metrics::record_break_glass_rejected("unauthenticated");
            note_refusal(request, &reason);
            return Err(GateError::UnauthenticatedOverride);
        };

        let now = self.clock.now();
        if !self
            .limiter
            .allow(&principal.subject, now, self.policy.max_per_hour)
        {
            warn!(
                target: "break_glass",
                identity = %principal.subject,
                max_per_hour = self.policy.max_per_hour,
                "Break-glass rate limit exceeded"
            );
            metrics::record_break_glass_rejected("rate_limited");
            note_refusal(request, &reason);
            let retry_after_secs = self
                .limiter
                .next_expiry(&principal.subject, now)
                .map_or(1, |expiry| secs_until(expiry, now));
            return Err(GateError::BreakGlassRateLimited {
                max_per_hour: self.policy.max_per_hour,
                retry_after_secs,
            });
        }

        principal.grant_role(ADMIN_ROLE);
        let identity = principal.subject.clone();
        let origin = network_origin(request.headers(), request.extensions());

        let extensions = request.extensions_mut();
        extensions.insert(principal);
        extensions.insert(ConsentBypass);
        extensions.insert(EmergencyContext::active(reason.clone()));

        warn!(
            target: "break_glass",
            event_id = %uuid::Uuid::new_v4(),
            identity = %identity,
            reason = %reason,
            path = %request.uri().path(),
            method = %request.method(),
            origin = %origin,
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "Break-glass override activated"
        );
        metrics::record_break_glass_activated();

        Ok(true)
    }
}

/// Hand a refused override's reason to the audit layer, if one is mounted
fn note_refusal(request: &Request, reason: &str) {
    if let Some(slot) = request.extensions().get::<AuditSlot>() {
        slot.note_refused_override(reason);
    }
}

/// Override middleware
///
/// Use with `axum::middleware::from_fn_with_state(gate, emergency_override_gate)`,
/// layered inside upstream authentication so [`Principal`] is already set.
pub async fn emergency_override_gate(
    State(gate): State<Arc<BreakGlassGate>>,
    mut request: Request,
    next: Next,
) -> Response {
    match gate.apply(&mut request) {
        Ok(_) => next.run(request).await,
        Err(error) => error.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::break_glass::context::consent_bypassed;
    use crate::clock::MockClock;
    use axum::body::Body;
    use std::time::Duration;

    fn gate() -> (BreakGlassGate, Arc<MockClock>) {
        let clock = Arc::new(MockClock::default());
        let gate = BreakGlassGate::with_clock(
            Arc::new(BreakGlassLimiter::new()),
            BreakGlassPolicy::default(),
            clock.clone(),
        );
        (gate, clock)
    }

    fn request(path: &str, reason: Option<&str>, principal: Option<Principal>) -> Request {
        let mut builder = axum::http::Request::builder().uri(path);
        if let Some(reason) = reason {
            builder = builder.header(BREAK_GLASS_HEADER, reason);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        if let Some(principal) = principal {
            request.extensions_mut().insert(principal);
        }
        request
    }

    fn clinician() -> Principal {
        Principal::new("dr-grey", vec!["clinician".to_string()])
    }

    #[test]
    fn test_override_elevates_and_marks_request() {
        let (gate, _clock) = gate();
        let mut req = request("/fhir/Patient/1", Some("unconscious patient"), Some(clinician()));

        assert!(gate.apply(&mut req).unwrap());

        let principal = req.extensions().get::<Principal>().unwrap();
        assert!(principal.has_role(ADMIN_ROLE));
        assert!(principal.has_role("clinician"));
        assert!(consent_bypassed(req.extensions()));

        let context = EmergencyContext::of(req.extensions());
        assert!(context.active);
        assert_eq!(context.reason.as_deref(), Some("unconscious patient"));
    }

    #[test]
    fn test_existing_admin_role_not_duplicated() {
        let (gate, _clock) = gate();
        let principal = Principal::new("root", vec![ADMIN_ROLE.to_string()]);
        let mut req = request("/fhir/Observation", Some("code blue"), Some(principal));

        gate.apply(&mut req).unwrap();

        let principal = req.extensions().get::<Principal>().unwrap();
        assert_eq!(principal.roles, vec![ADMIN_ROLE.to_string()]);
    }

    #[test]
    fn test_unauthenticated_override_touches_no_state() {
        let (gate, _clock) = gate();
        let mut req = request("/fhir/Patient/1", Some("emergency"), None);

        let err = gate.apply(&mut req).unwrap_err();
        assert!(matches!(err, GateError::UnauthenticatedOverride));
        assert_eq!(gate.limiter().tracked_identities(), 0);
        assert!(!EmergencyContext::of(req.extensions()).active);
    }

    #[test]
    fn test_blank_reason_is_no_op() {
        let (gate, _clock) = gate();
        for reason in ["", "   ", "\t"] {
            let mut req = request("/fhir/Patient/1", Some(reason), Some(clinician()));
            assert!(!gate.apply(&mut req).unwrap());
            assert!(!EmergencyContext::of(req.extensions()).active);
            assert!(!consent_bypassed(req.extensions()));
        }
        assert_eq!(gate.limiter().tracked_identities(), 0);
    }

    #[test]
    fn test_missing_header_or_ungoverned_path_passes_through() {
        let (gate, _clock) = gate();

        let mut req = request("/fhir/Patient/1", None, Some(clinician()));
        assert!(!gate.apply(&mut req).unwrap());

        let mut req = request("/admin/plans", Some("emergency"), Some(clinician()));
        assert!(!gate.apply(&mut req).unwrap());
        let principal = req.extensions().get::<Principal>().unwrap();
        assert!(!principal.has_role(ADMIN_ROLE));

        assert_eq!(gate.limiter().tracked_identities(), 0);
    }

    #[test]
    fn test_hourly_cap_then_recovery() {
        let (gate, clock) = gate();

        for _ in 0..10 {
            let mut req = request("/fhir/Patient/1", Some("mass casualty"), Some(clinician()));
            assert!(gate.apply(&mut req).unwrap());
        }

        let mut req = request("/fhir/Patient/1", Some("mass casualty"), Some(clinician()));
        let err = gate.apply(&mut req).unwrap_err();
        assert!(matches!(
            err,
            GateError::BreakGlassRateLimited {
                max_per_hour: 10,
                retry_after_secs: 3600
            }
        ));
        assert!(!consent_bypassed(req.extensions()));

        // The oldest override ages out first
        clock.advance(Duration::from_secs(1800));
        let mut req = request("/fhir/Patient/1", Some("mass casualty"), Some(clinician()));
        assert!(matches!(
            gate.apply(&mut req).unwrap_err(),
            GateError::BreakGlassRateLimited {
                retry_after_secs: 1800,
                ..
            }
        ));

        clock.advance(Duration::from_secs(1801));
        let mut req = request("/fhir/Patient/1", Some("mass casualty"), Some(clinician()));
        assert!(gate.apply(&mut req).unwrap());
    }

    #[test]
    fn test_reason_is_trimmed() {
        let (gate, _clock) = gate();
        let mut req = request("/fhir/Patient/1", Some("  stroke  "), Some(clinician()));
        gate.apply(&mut req).unwrap();
        assert_eq!(
            EmergencyContext::of(req.extensions()).reason.as_deref(),
            Some("stroke")
        );
    }
}
