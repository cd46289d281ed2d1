//! Login state machine, session issuance and credential checks.

mod config;
mod credentials;
mod scopes;
mod service;
mod session;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::store::{NamespaceAccess, RepositoryAccess, UserAccount};

pub use config::AuthConfig;
pub use credentials::{Argon2Verifier, CredentialVerifier};
pub use scopes::{scope_hash, CachedScopeAuthorizer, DormantScopes, ScopeAuthorizer};
pub use service::{transaction_key, AuthService};
pub use session::{is_reusable, PASSWORD_GRANT};

pub const LOGIN_ERROR_MESSAGE: &str = "Oops! Error occurred when logging in!";
pub const NO_ACCOUNT_MESSAGE: &str = "No user account found!";
pub const ACCOUNT_LOCKED_MESSAGE: &str =
    "User account has been locked! Contact system administrator.";
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid username or password!";
pub const NOT_AUTHORIZED_MESSAGE: &str = "User is not authorized to access!";

#[derive(Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginStatus {
    Ok,
    Forbidden,
    InternalError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginResult {
    pub success: bool,
    pub status: LoginStatus,
    pub error_message: String,
    pub session_id: String,
    pub authorized_scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub role: String,
}

impl LoginResult {
    #[must_use]
    pub fn forbidden(message: &str) -> Self {
        Self::failure(LoginStatus::Forbidden, message)
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::failure(LoginStatus::InternalError, LOGIN_ERROR_MESSAGE)
    }

    fn failure(status: LoginStatus, message: &str) -> Self {
        Self {
            success: false,
            status,
            error_message: message.to_string(),
            session_id: String::new(),
            authorized_scopes: Vec::new(),
            expires_at: None,
            role: String::new(),
        }
    }
}

/// Everything a login attempt produced. `account` and the access lists are only
/// populated on success.
#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub account: Option<UserAccount>,
    pub namespaces: Vec<NamespaceAccess>,
    pub repositories: Vec<RepositoryAccess>,
    pub result: LoginResult,
}

impl LoginOutcome {
    #[must_use]
    pub fn rejected(result: LoginResult) -> Self {
        Self {
            account: None,
            namespaces: Vec::new(),
            repositories: Vec::new(),
            result,
        }
    }
}

/// Entry point used by the HTTP edge.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate_user(
        &self,
        request: &LoginRequest,
        user_agent: &str,
        client_ip: &str,
    ) -> LoginOutcome;

    /// Lifetime of issued sessions, used as the cookie max-age.
    fn session_expiry_seconds(&self) -> i64;
}
