//! Request Identity
//!
//! Types that upstream authentication places into request extensions, and
//! the lookup order the admission gate uses to pick a quota identity.

use axum::extract::{ConnectInfo, Request};
use axum::http::{Extensions, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Header carrying a caller-supplied client identifier
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Subject asserted by an authenticating proxy in front of the gatekeeper
pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";

/// Comma-separated roles asserted alongside [`AUTHENTICATED_USER_HEADER`]
pub const AUTHENTICATED_ROLES_HEADER: &str = "x-authenticated-roles";

/// Role granted for the lifetime of a break-glass request
pub const ADMIN_ROLE: &str = "admin";

/// Identifier of the API key that authenticated the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyId(pub String);

/// Generic client identifier set by upstream middleware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// Authenticated user and the roles effective for this request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier
    pub subject: String,

    /// Effective roles
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            roles,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Add a role if not already present
    pub fn grant_role(&mut self, role: &str) {
        if !self.has_role(role) {
            self.roles.push(role.to_string());
        }
    }
}

/// Pick the quota identity for a request
///
/// Order: API key id, client id extension, `X-Client-ID` header, then the
/// network origin.
pub fn resolve_identity(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(ApiKeyId(id)) = extensions.get::<ApiKeyId>() {
        if !id.is_empty() {
            return id.clone();
        }
    }

    if let Some(ClientId(id)) = extensions.get::<ClientId>() {
        if !id.is_empty() {
            return id.clone();
        }
    }

    if let Some(id) = header_str(headers, CLIENT_ID_HEADER) {
        return id.to_string();
    }

    network_origin(headers, extensions)
}

/// Build a [`Principal`] from headers set by a trusted authenticating proxy
pub fn principal_from_headers(headers: &HeaderMap) -> Option<Principal> {
    let subject = header_str(headers, AUTHENTICATED_USER_HEADER)?;
    let roles = header_str(headers, AUTHENTICATED_ROLES_HEADER)
        .map(|roles| {
            roles
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(Principal::new(subject, roles))
}

/// Middleware inserting the proxy-asserted [`Principal`], if any
///
/// Only mount this behind a proxy that strips these headers from client
/// traffic.
pub async fn trusted_proxy_identity(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<Principal>().is_none() {
        if let Some(principal) = principal_from_headers(request.headers()) {
            request.extensions_mut().insert(principal);
        }
    }
    next.run(request).await
}

/// Best-effort network origin of the caller
pub fn network_origin(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.to_string();
    }

    if let Some(ConnectInfo(addr)) = extensions.get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    "unknown".to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
