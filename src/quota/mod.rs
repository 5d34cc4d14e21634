//! Quota Plans and Admission Accounting
//!
//! Per-identity minute/hour/day windows and an in-flight gauge, evaluated
//! against the identity's assigned plan.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ClientQuotaTracker                        │
//! │   RwLock<HashMap<identity, Arc<ClientCounter>>>            │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐   ┌────────────────────────┐  │
//! │  │ ClientCounter          │   │ PlanRegistry           │  │
//! │  │  atomics: min/hr/day,  │   │  plans by name         │  │
//! │  │  in-flight gauge       │   │  identity → plan name  │  │
//! │  │  Mutex<WindowResets>   │   │  fallback: "free"      │  │
//! │  └────────────────────────┘   └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Windows roll over lazily on the next `allow` or `usage` call, so no timer
//! exists per identity and housekeeping is never needed for correctness.

pub mod counter;
pub mod plan;
pub mod tracker;

pub use counter::{ClientCounter, Denial};
pub use plan::{PlanRegistry, RatePlan, DEFAULT_PLAN};
pub use tracker::{AdmissionInfo, ClientQuotaTracker, UsageSnapshot};
