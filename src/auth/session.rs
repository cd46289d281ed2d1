//! Session reuse and issuance.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::store::AuthSession;

pub const PASSWORD_GRANT: &str = "password";

/// A stored session is reusable only while it stays valid for longer than `guard`.
/// Sessions without an expiry are never reused.
#[must_use]
pub fn is_reusable(session: &AuthSession, now: DateTime<Utc>, guard: Duration) -> bool {
    session
        .expires_at
        .is_some_and(|expires_at| expires_at > now + guard)
}

#[derive(Debug)]
pub struct SessionRequest<'a> {
    pub user_id: Uuid,
    pub scope_hash: &'a str,
    pub user_agent: &'a str,
    pub client_ip: &'a str,
}

/// Mint a new password-grant session issued at `now`.
#[must_use]
pub fn issue(request: &SessionRequest<'_>, now: DateTime<Utc>, lifetime: Duration) -> AuthSession {
    AuthSession {
        session_id: Uuid::new_v4().to_string(),
        user_id: request.user_id,
        scope_hash: request.scope_hash.to_string(),
        issued_at: now,
        expires_at: Some(now + lifetime),
        user_agent: request.user_agent.to_string(),
        client_ip: request.client_ip.to_string(),
        grant_type: PASSWORD_GRANT.to_string(),
    }
}
