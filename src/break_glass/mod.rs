//! Break-Glass Emergency Overrides
//!
//! An audited bypass of routine authorization and consent for clinical
//! emergencies, capped per identity on a rolling hour.
//!
//! # Flow
//!
//! ```text
//! request ──► governed path + non-blank reason? ──no──► handler
//!                        │ yes
//!                        ▼
//!             authenticated Principal? ──no──► 401
//!                        │ yes
//!                        ▼
//!             BreakGlassLimiter::allow ──no──► 429
//!                        │ yes
//!                        ▼
//!     grant admin role, ConsentBypass, EmergencyContext, warn! event
//!                        │
//!                        ▼
//!                     handler
//! ```

pub mod context;
pub mod gate;
pub mod limiter;

pub use context::{consent_bypassed, ConsentBypass, EmergencyContext};
pub use gate::{emergency_override_gate, BreakGlassGate, BreakGlassPolicy, BREAK_GLASS_HEADER};
pub use limiter::{BreakGlassLimiter, BREAK_GLASS_WINDOW, DEFAULT_MAX_PER_HOUR};
