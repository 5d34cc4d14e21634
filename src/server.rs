// HTTP server: governed FHIR routes, admin routes, health and metrics
//
// Request flow on governed routes (outermost first):
//   trace -> trusted_proxy_identity -> audit_trail -> emergency_override_gate
//         -> admission_gate -> capture_audit_context -> handler
//
// A refused override (401/429) returns before admission, so it never
// creates or charges a quota counter.

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::admin::{self, AdminService};
use crate::audit::{audit_trail, capture_audit_context, AuditSink, TracingAuditSink};
use crate::break_glass::{
    consent_bypassed, emergency_override_gate, BreakGlassGate, BreakGlassLimiter,
    EmergencyContext,
};
use crate::config::Config;
use crate::housekeeping::spawn_housekeeping;
use crate::metrics;
use crate::middleware::{admission_gate, trusted_proxy_identity, Principal};
use crate::quota::ClientQuotaTracker;

/// Shared components behind the router
#[derive(Debug, Clone)]
pub struct AppState {
    pub tracker: Arc<ClientQuotaTracker>,
    pub break_glass: Arc<BreakGlassGate>,
    pub admin: Arc<AdminService>,
    pub audit: Arc<dyn AuditSink>,
}

impl AppState {
    /// Wire up trackers and gates from configuration
    pub fn from_config(config: &Config) -> Self {
        let tracker = Arc::new(ClientQuotaTracker::new(Arc::new(config.plan_registry())));
        let limiter = Arc::new(BreakGlassLimiter::new());
        Self::with_components(
            tracker,
            limiter,
            config.break_glass_policy(),
            Arc::new(TracingAuditSink),
        )
    }

    /// The override gate shares the tracker's clock
    pub fn with_components(
        tracker: Arc<ClientQuotaTracker>,
        limiter: Arc<BreakGlassLimiter>,
        policy: crate::break_glass::BreakGlassPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let break_glass = Arc::new(BreakGlassGate::with_clock(
            limiter,
            policy,
            Arc::clone(tracker.clock()),
        ));
        let admin = Arc::new(AdminService::new(Arc::clone(&tracker)));
        Self {
            tracker,
            break_glass,
            admin,
            audit,
        }
    }
}

/// Build the full application router
pub fn router(state: &AppState) -> Router {
    let governed = Router::new()
        .route("/fhir/{*resource}", any(fhir_resource))
        .layer(middleware::from_fn(capture_audit_context))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.tracker),
            admission_gate,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.break_glass),
            emergency_override_gate,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.audit),
            audit_trail,
        ))
        .layer(middleware::from_fn(trusted_proxy_identity));

    Router::new()
        .merge(governed)
        .nest("/admin", admin::router(Arc::clone(&state.admin)))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

/// What the governed handler saw after both gates ran
#[derive(Debug, Serialize)]
struct ResourceAccess {
    method: String,
    path: String,
    user: Option<String>,
    roles: Vec<String>,
    consent_bypassed: bool,
    emergency: EmergencyContext,
}

/// Governed FHIR resource endpoint
///
/// Stands in for the clinical backend: it reports the request state the
/// gates produced so downstream consent and audit decisions are observable.
async fn fhir_resource(method: Method, request: Request) -> Json<ResourceAccess> {
    let extensions = request.extensions();
    let principal = extensions.get::<Principal>();

    Json(ResourceAccess {
        method: method.to_string(),
        path: request.uri().path().to_string(),
        user: principal.map(|p| p.subject.clone()),
        roles: principal.map(|p| p.roles.clone()).unwrap_or_default(),
        consent_bypassed: consent_bypassed(extensions),
        emergency: EmergencyContext::of(extensions),
    })
}

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Run the gatekeeper until Ctrl-C
pub async fn serve(config: Config) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let state = AppState::from_config(&config);
    let housekeeping = spawn_housekeeping(
        Arc::clone(&state.tracker),
        Arc::clone(state.break_glass.limiter()),
        config.housekeeping(),
    );

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Gatekeeper listening on {}", addr);

    let app = router(&state);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error");

    housekeeping.shutdown().await;
    info!("Gatekeeper stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
