//! Credentials and the identity provider seam.
//!
//! Session storage belongs to the embedding application. The core only polls
//! an [`IdentityProvider`] at the moment it needs credentials, and checks the
//! token's `exp` claim locally before any network I/O.

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use parley_proto::UserId;
use serde_json::Value;

use crate::error::AuthError;

/// Bearer token plus the user it belongs to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
    user_id: UserId,
}

impl Credentials {
    /// Build from non-empty parts.
    pub fn new(token: impl Into<String>, user_id: impl Into<UserId>) -> Result<Self, AuthError> {
        let token = token.into();
        let user_id = user_id.into();

        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        if user_id.is_blank() {
            return Err(AuthError::MissingUserId);
        }
        Ok(Self { token, user_id })
    }

    /// Build from whatever the identity provider returned.
    pub fn from_parts(token: Option<String>, user_id: Option<String>) -> Result<Self, AuthError> {
        let token = token.ok_or(AuthError::MissingToken)?;
        let user_id = user_id.ok_or(AuthError::MissingUserId)?;
        Self::new(token, user_id)
    }

    /// Raw token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Fail if the token is expired or undecodable.
    pub fn check_expiry(&self, unix_now: i64) -> Result<(), AuthError> {
        check_token(&self.token, unix_now)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// `exp` claim of a JWT, if it has one.
///
/// Signature is not verified; this is a cheap precondition, not
/// authentication.
pub fn token_expiry(token: &str) -> Result<Option<i64>, AuthError> {
    let malformed = |reason: &str| AuthError::Malformed { reason: reason.to_string() };

    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_)) = (segments.next(), segments.next(), segments.next())
    else {
        return Err(malformed("expected three dot-separated segments"));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| malformed(&e.to_string()))?;
    let claims: Value = serde_json::from_slice(&bytes).map_err(|e| malformed(&e.to_string()))?;

    Ok(claims.get("exp").and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))))
}

/// Reject expired or malformed tokens. Tokens without `exp` never expire.
pub fn check_token(token: &str, unix_now: i64) -> Result<(), AuthError> {
    match token_expiry(token)? {
        Some(expired_at) if expired_at <= unix_now => {
            Err(AuthError::Expired { expired_at, now: unix_now })
        },
        _ => Ok(()),
    }
}

/// Source of the current session.
///
/// Polled synchronously on every connect and REST call, so implementations
/// must be cheap.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Current bearer token.
    fn token(&self) -> Option<String>;

    /// Current user id.
    fn user_id(&self) -> Option<String>;

    /// Whether a session is present.
    fn is_logged_in(&self) -> bool {
        self.token().is_some() && self.user_id().is_some()
    }

    /// Snapshot both values as [`Credentials`].
    fn credentials(&self) -> Result<Credentials, AuthError> {
        Credentials::from_parts(self.token(), self.user_id())
    }

    /// Drop the session after the server rejected it.
    fn invalidate(&self) {}
}
