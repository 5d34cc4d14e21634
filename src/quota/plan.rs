//! Rate Plans and Plan Registry
//!
//! Named quota tiers and the identity → plan assignment table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use crate::error::GateError;

/// Name of the plan every unassigned identity falls back to
pub const DEFAULT_PLAN: &str = "free";

/// A named bundle of rate and concurrency limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePlan {
    /// Plan name (registry key)
    #[serde(default)]
    pub name: String,

    /// Requests per minute, before burst
    pub per_minute: u32,

    /// Requests per hour
    pub per_hour: u32,

    /// Requests per day
    pub per_day: u32,

    /// Extra allowance on top of the minute limit
    #[serde(default)]
    pub burst: u32,

    /// Maximum in-flight requests (0 disables the check)
    #[serde(default)]
    pub max_concurrent: u32,
}

impl RatePlan {
    /// Create a plan with explicit limits
    pub fn new(
        name: impl Into<String>,
        per_minute: u32,
        per_hour: u32,
        per_day: u32,
        burst: u32,
        max_concurrent: u32,
    ) -> Self {
        Self {
            name: name.into(),
            per_minute,
            per_hour,
            per_day,
            burst,
            max_concurrent,
        }
    }

    /// Effective minute ceiling (limit plus burst)
    pub fn minute_ceiling(&self) -> u64 {
        u64::from(self.per_minute) + u64::from(self.burst)
    }

    pub fn free() -> Self {
        Self::new(DEFAULT_PLAN, 60, 1_000, 10_000, 10, 5)
    }

    pub fn starter() -> Self {
        Self::new("starter", 300, 10_000, 100_000, 50, 20)
    }

    pub fn professional() -> Self {
        Self::new("professional", 1_000, 50_000, 500_000, 200, 50)
    }

    pub fn enterprise() -> Self {
        Self::new("enterprise", 5_000, 200_000, 2_000_000, 1_000, 200)
    }

    /// The four tiers registered at construction
    pub fn builtin() -> Vec<RatePlan> {
        vec![
            Self::free(),
            Self::starter(),
            Self::professional(),
            Self::enterprise(),
        ]
    }
}

/// Registry of plans and identity assignments
///
/// Plans are handed out as `Arc<RatePlan>`; re-registering a name swaps the
/// entry without touching plans already held by callers.
#[derive(Debug)]
pub struct PlanRegistry {
    plans: RwLock<HashMap<String, Arc<RatePlan>>>,
    assignments: RwLock<HashMap<String, String>>,
    fallback: Arc<RatePlan>,
}

impl PlanRegistry {
    /// Create a registry with the built-in tiers
    pub fn new() -> Self {
        let plans = RatePlan::builtin()
            .into_iter()
            .map(|plan| (plan.name.clone(), Arc::new(plan)))
            .collect();

        Self {
            plans: RwLock::new(plans),
            assignments: RwLock::new(HashMap::new()),
            fallback: Arc::new(RatePlan::free()),
        }
    }

    /// Insert or replace a plan by name
    pub fn register_plan(&self, plan: RatePlan) {
        info!(
            plan = %plan.name,
            per_minute = plan.per_minute,
            per_hour = plan.per_hour,
            per_day = plan.per_day,
            burst = plan.burst,
            max_concurrent = plan.max_concurrent,
            "Registering rate plan"
        );
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        plans.insert(plan.name.clone(), Arc::new(plan));
    }

    /// Assign an identity to a registered plan
    pub fn assign_plan(&self, identity: &str, plan_name: &str) -> Result<(), GateError> {
        if !self.contains(plan_name) {
            return Err(GateError::PlanNotFound(plan_name.to_string()));
        }

        info!(identity, plan = plan_name, "Assigning rate plan");
        let mut assignments = self
            .assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        assignments.insert(identity.to_string(), plan_name.to_string());
        Ok(())
    }

    /// Resolve the plan governing an identity
    ///
    /// Unassigned identities and dangling assignments resolve to `free`.
    pub fn plan_for(&self, identity: &str) -> Arc<RatePlan> {
        let assigned = {
            let assignments = self
                .assignments
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            assignments.get(identity).cloned()
        };

        let name = assigned.as_deref().unwrap_or(DEFAULT_PLAN);
        self.get(name)
            .or_else(|| self.get(DEFAULT_PLAN))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Look up a plan by name
    pub fn get(&self, name: &str) -> Option<Arc<RatePlan>> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        plans.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        plans.contains_key(name)
    }

    /// Explicit assignment for an identity, if any
    pub fn assignment(&self, identity: &str) -> Option<String> {
        let assignments = self
            .assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        assignments.get(identity).cloned()
    }

    /// All plans, sorted by name
    pub fn list_plans(&self) -> Vec<RatePlan> {
        let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<RatePlan> = plans.values().map(|p| (**p).clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tiers_registered() {
        let registry = PlanRegistry::new();
        for name in ["free", "starter", "professional", "enterprise"] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert_eq!(registry.list_plans().len(), 4);
    }

    #[test]
    fn test_builtin_tiers_strictly_increasing() {
        let tiers = RatePlan::builtin();
        for pair in tiers.windows(2) {
            let (lo, hi) = (&pair[0], &pair[1]);
            assert!(lo.per_minute < hi.per_minute);
            assert!(lo.per_hour < hi.per_hour);
            assert!(lo.per_day < hi.per_day);
            assert!(lo.burst < hi.burst);
            assert!(lo.max_concurrent < hi.max_concurrent);
        }
    }

    #[test]
    fn test_unassigned_identity_gets_free() {
        let registry = PlanRegistry::new();
        assert_eq!(registry.plan_for("nobody").name, "free");
    }

    #[test]
    fn test_assign_unknown_plan_fails() {
        let registry = PlanRegistry::new();
        let err = registry.assign_plan("client-a", "platinum").unwrap_err();
        assert!(matches!(err, GateError::PlanNotFound(name) if name == "platinum"));
        assert!(registry.assignment("client-a").is_none());
    }

    #[test]
    fn test_assign_and_resolve() {
        let registry = PlanRegistry::new();
        registry.assign_plan("client-a", "enterprise").unwrap();
        assert_eq!(registry.plan_for("client-a").name, "enterprise");
    }

    #[test]
    fn test_dangling_assignment_falls_back_to_free() {
        let registry = PlanRegistry::new();
        registry
            .assignments
            .write()
            .unwrap()
            .insert("client-a".to_string(), "retired".to_string());

        assert_eq!(registry.plan_for("client-a").name, "free");
    }

    #[test]
    fn test_register_replaces_by_name() {
        let registry = PlanRegistry::new();
        registry.assign_plan("client-a", "starter").unwrap();
        let before = registry.plan_for("client-a");

        registry.register_plan(RatePlan::new("starter", 1, 2, 3, 0, 0));

        let after = registry.plan_for("client-a");
        assert_eq!(after.per_minute, 1);
        // Previously resolved plans are not mutated
        assert_eq!(before.per_minute, 300);
        assert_eq!(registry.list_plans().len(), 4);
    }

    #[test]
    fn test_list_plans_sorted() {
        let registry = PlanRegistry::new();
        registry.register_plan(RatePlan::new("custom-a", 1, 1, 1, 0, 0));
        let names: Vec<String> = registry.list_plans().into_iter().map(|p| p.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_minute_ceiling_includes_burst() {
        assert_eq!(RatePlan::free().minute_ceiling(), 70);
    }
}
