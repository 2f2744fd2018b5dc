//! Authorisation front-end
//!
//! Stateless bearer-token validation and route-level guards. Verification
//! produces the [`UserContext`] carried inside every envelope so service
//! blocks never re-validate tokens. Guard evaluation returns a sum type;
//! the HTTP layer maps it to 401/403 at the edge only.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthSettings;
use crate::envelope::UserContext;

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Role name.
    #[serde(default)]
    pub role: String,
    /// Granted permissions, `service:action` form.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Issued-at, seconds since epoch.
    #[serde(default)]
    pub iat: i64,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Access requirement attached to a route.
#[derive(Debug, Clone)]
pub enum RouteGuard {
    /// Any caller with a valid token.
    Authenticated,
    /// Caller's role must be in the allow-list.
    Roles(&'static [&'static str]),
    /// Caller must hold the permission (wildcards honoured).
    Permission(String),
}

/// Outcome of evaluating a guard against a request.
#[derive(Debug)]
pub enum AuthDecision {
    /// Admitted; the produced context rides in the envelope.
    Allow(Box<UserContext>),
    /// No token, or an invalid one.
    Unauthorised(String),
    /// Valid token, insufficient rights.
    Forbidden(String),
}

/// Validates bearer tokens against the configured secret and algorithm.
#[derive(Clone)]
pub struct AuthValidator {
    key: DecodingKey,
    validation: Validation,
}

impl AuthValidator {
    /// Builds a validator from auth settings.
    ///
    /// Unknown algorithm names fall back to HS256.
    #[must_use]
    pub fn new(settings: &AuthSettings) -> Self {
        let algorithm = settings
            .algorithm
            .parse::<Algorithm>()
            .unwrap_or(Algorithm::HS256);
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(settings.secret.as_bytes()),
            validation,
        }
    }

    /// Verifies a raw token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason (bad signature, expired, missing
    /// subject) as a string suitable for a 401 body.
    pub fn verify(&self, token: &str) -> Result<Claims, String> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| format!("invalid token: {e}"))?;
        if data.claims.sub.trim().is_empty() {
            return Err("token is missing a subject".to_string());
        }
        Ok(data.claims)
    }

    /// Evaluates a guard against an `Authorization` header value.
    ///
    /// Produces the full decision: `Allow` carries the user context to embed
    /// in the outgoing envelope.
    #[must_use]
    pub fn authorize(&self, authorization: Option<&str>, guard: &RouteGuard) -> AuthDecision {
        let Some(header) = authorization else {
            return AuthDecision::Unauthorised("missing authorization header".to_string());
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return AuthDecision::Unauthorised("authorization header is not a bearer token".into());
        };

        let claims = match self.verify(token.trim()) {
            Ok(claims) => claims,
            Err(reason) => {
                debug!(reason, "token rejected");
                return AuthDecision::Unauthorised(reason);
            }
        };

        match guard {
            RouteGuard::Authenticated => {}
            RouteGuard::Roles(allowed) => {
                if !allowed.contains(&claims.role.as_str()) {
                    return AuthDecision::Forbidden(format!(
                        "role '{}' is not permitted here",
                        claims.role
                    ));
                }
            }
            RouteGuard::Permission(required) => {
                if !holds_permission(&claims.permissions, required) {
                    return AuthDecision::Forbidden(format!("missing permission '{required}'"));
                }
            }
        }

        AuthDecision::Allow(Box::new(UserContext {
            user_id: claims.sub,
            role: claims.role,
            permissions: claims.permissions,
            trace_id: None,
            client_ip: None,
        }))
    }
}

/// Checks a granted-permission list against a requirement.
///
/// A grant of `*` matches everything; `vehicles:*` matches any action on the
/// `vehicles` resource; otherwise the match is exact.
#[must_use]
pub fn holds_permission(granted: &[String], required: &str) -> bool {
    granted.iter().any(|grant| {
        if grant == "*" || grant == required {
            return true;
        }
        match grant.strip_suffix(":*") {
            Some(resource) => required
                .split_once(':')
                .is_some_and(|(req_resource, _)| req_resource == resource),
            None => false,
        }
    })
}
