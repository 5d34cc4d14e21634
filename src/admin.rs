//! Admin Surface
//!
//! Plan management and per-identity usage introspection, as a typed service
//! and as axum routes mounted under `/admin`.

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::GateError;
use crate::quota::{ClientQuotaTracker, PlanRegistry, RatePlan, UsageSnapshot};

/// Admin operations over the plan registry and tracker
#[derive(Debug, Clone)]
pub struct AdminService {
    tracker: Arc<ClientQuotaTracker>,
}

impl AdminService {
    pub fn new(tracker: Arc<ClientQuotaTracker>) -> Self {
        Self { tracker }
    }

    fn plans(&self) -> &PlanRegistry {
        self.tracker.plans()
    }

    pub fn list_plans(&self) -> Vec<RatePlan> {
        self.plans().list_plans()
    }

    /// Insert or replace a plan; the name must be non-blank
    pub fn upsert_plan(&self, mut plan: RatePlan) -> Result<RatePlan, GateError> {
        plan.name = plan.name.trim().to_string();
        if plan.name.is_empty() {
            return Err(GateError::PlanNameRequired);
        }

        self.plans().register_plan(plan.clone());
        Ok(plan)
    }

    pub fn usage(&self, identity: &str) -> UsageSnapshot {
        self.tracker.usage(identity)
    }

    pub fn assign_plan(&self, identity: &str, plan_name: &str) -> Result<(), GateError> {
        self.plans().assign_plan(identity, plan_name)
    }

    /// Returns false if the identity had no tracked state
    pub fn reset_counters(&self, identity: &str) -> bool {
        let reset = self.tracker.reset_counters(identity);
        info!(identity, reset, "Admin reset of quota counters");
        reset
    }
}

/// Body of `PUT /admin/clients/{id}/plan`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignPlanRequest {
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignPlanResponse {
    pub identity: String,
    pub plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResponse {
    pub identity: String,
    pub reset: bool,
}

/// Admin routes, to be nested under `/admin`
pub fn router(service: Arc<AdminService>) -> Router {
    Router::new()
        .route("/plans", get(list_plans).put(upsert_plan))
        .route("/clients/{identity}/usage", get(usage))
        .route("/clients/{identity}/plan", put(assign_plan))
        .route("/clients/{identity}/reset", post(reset_counters))
        .with_state(service)
}

async fn list_plans(State(service): State<Arc<AdminService>>) -> Json<Vec<RatePlan>> {
    Json(service.list_plans())
}

async fn upsert_plan(
    State(service): State<Arc<AdminService>>,
    Json(plan): Json<RatePlan>,
) -> Result<Json<RatePlan>, GateError> {
    service.upsert_plan(plan).map(Json)
}

async fn usage(
    State(service): State<Arc<AdminService>>,
    Path(identity): Path<String>,
) -> Json<UsageSnapshot> {
    Json(service.usage(&identity))
}

async fn assign_plan(
    State(service): State<Arc<AdminService>>,
    Path(identity): Path<String>,
    Json(body): Json<AssignPlanRequest>,
) -> Result<Json<AssignPlanResponse>, GateError> {
    service.assign_plan(&identity, &body.plan)?;
    Ok(Json(AssignPlanResponse {
        identity,
        plan: body.plan,
    }))
}

async fn reset_counters(
    State(service): State<Arc<AdminService>>,
    Path(identity): Path<String>,
) -> Json<ResetResponse> {
    let reset = service.reset_counters(&identity);
    Json(ResetResponse { identity, reset })
}
