//! FHIR Gatekeeper Library
//!
//! Admission control for a clinical API: per-client rate plans with
//! minute/hour/day windows and a concurrency ceiling, an audited break-glass
//! override for emergencies, and the admin surface that manages both.

pub mod admin;
pub mod audit;
pub mod break_glass;
pub mod clock;
pub mod config;
pub mod error;
pub mod housekeeping;
pub mod metrics;
pub mod middleware;
pub mod quota;
pub mod server;

pub use error::{GateError, Window};
