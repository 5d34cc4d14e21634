//! HTTP middleware for governed routes

pub mod admission;
pub mod identity;

pub use admission::{admission_gate, AdmissionSlot};
pub use identity::{
    principal_from_headers, resolve_identity, trusted_proxy_identity, ApiKeyId, ClientId,
    Principal, ADMIN_ROLE, AUTHENTICATED_ROLES_HEADER, AUTHENTICATED_USER_HEADER,
    CLIENT_ID_HEADER,
};
