//! Relational store adapter for user, session and access tables.
//!
//! Every operation takes an optional ambient transaction. When one is supplied the
//! call participates in it; otherwise it runs standalone against the pool.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::tx::TransactionBackend;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Why an account was locked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockReason {
    NewAccountVerificationRequired,
    FailedLoginAttempts,
    AdminLocked,
}

impl LockReason {
    #[must_use]
    pub const fn code(self) -> i16 {
        match self {
            Self::NewAccountVerificationRequired => 1,
            Self::FailedLoginAttempts => 2,
            Self::AdminLocked => 3,
        }
    }

    #[must_use]
    pub const fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(Self::NewAccountVerificationRequired),
            2 => Some(Self::FailedLoginAttempts),
            3 => Some(Self::AdminLocked),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserAccount {
    pub id: Uuid,
    pub username: String,
    pub locked: bool,
    pub lock_reason: Option<LockReason>,
    pub failed_attempts: i32,
}

/// Stored password hash and salt for an account.
#[derive(Clone)]
pub struct Credential {
    pub hash: String,
    pub salt: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("hash", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub scope_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_agent: String,
    pub client_ip: String,
    pub grant_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeRoleBinding {
    pub scope_name: String,
    pub role_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct NamespaceAccess {
    pub id: Uuid,
    pub namespace: String,
    pub resource_id: Uuid,
    pub user_id: Uuid,
    pub access_level: String,
    pub granted_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct RepositoryAccess {
    pub id: Uuid,
    pub namespace: String,
    pub repository: String,
    pub resource_id: Uuid,
    pub user_id: Uuid,
    pub access_level: String,
    pub granted_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Stable category of a data-access failure, independent of the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    UniqueViolation,
    ForeignKeyViolation,
    Conflict,
    Connection,
    Timeout,
    Decode,
    Unknown,
}

impl StoreErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UniqueViolation => "unique_violation",
            Self::ForeignKeyViolation => "foreign_key_violation",
            Self::Conflict => "conflict",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Decode => "decode",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub operation: &'static str,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(operation: &'static str) -> Self {
        Self::new(StoreErrorKind::Timeout, operation, "deadline exceeded")
    }

    /// Classify a raw driver error into a stable category.
    #[must_use]
    pub fn classify(err: &sqlx::Error, operation: &'static str) -> Self {
        let kind = match err {
            sqlx::Error::RowNotFound => StoreErrorKind::NotFound,
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => StoreErrorKind::UniqueViolation,
                Some("23503") => StoreErrorKind::ForeignKeyViolation,
                Some("40001" | "40P01") => StoreErrorKind::Conflict,
                _ => StoreErrorKind::Unknown,
            },
            sqlx::Error::PoolTimedOut => StoreErrorKind::Timeout,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed => {
                StoreErrorKind::Connection
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => StoreErrorKind::Decode,
            _ => StoreErrorKind::Unknown,
        };
        Self::new(kind, operation, err.to_string())
    }
}

/// Data access needed by the login flow.
///
/// `tx` is the ambient transaction opened through the
/// [`TransactionManager`](crate::tx::TransactionManager); `None` runs the
/// statement outside any transaction.
#[async_trait]
pub trait AuthStore: TransactionBackend {
    async fn user_account(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
    ) -> Result<Option<UserAccount>, StoreError>;

    async fn credential(
        &self,
        tx: Option<&mut Self::Tx>,
        user_id: Uuid,
    ) -> Result<Credential, StoreError>;

    async fn record_failed_attempt(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
    ) -> Result<(), StoreError>;

    async fn lock_account(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
        reason: LockReason,
    ) -> Result<(), StoreError>;

    /// Clears the lock flag and resets the failed attempt counter.
    async fn unlock_account(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
    ) -> Result<(), StoreError>;

    async fn role(&self, tx: Option<&mut Self::Tx>, user_id: Uuid) -> Result<String, StoreError>;

    async fn scope_role_bindings(&self) -> Result<Vec<ScopeRoleBinding>, StoreError>;

    /// Most recently issued session for the `(user_id, scope_hash)` pair.
    async fn auth_session(
        &self,
        tx: Option<&mut Self::Tx>,
        scope_hash: &str,
        user_id: Uuid,
    ) -> Result<Option<AuthSession>, StoreError>;

    async fn remove_auth_session(
        &self,
        tx: Option<&mut Self::Tx>,
        session_id: &str,
    ) -> Result<(), StoreError>;

    async fn persist_auth_session(
        &self,
        tx: Option<&mut Self::Tx>,
        session: &AuthSession,
    ) -> Result<(), StoreError>;

    async fn persist_session_scope_binding(
        &self,
        tx: Option<&mut Self::Tx>,
        scopes: &[String],
        session_id: &str,
    ) -> Result<(), StoreError>;

    async fn namespace_access(
        &self,
        tx: Option<&mut Self::Tx>,
        user_id: Uuid,
    ) -> Result<Vec<NamespaceAccess>, StoreError>;

    async fn repository_access(
        &self,
        tx: Option<&mut Self::Tx>,
        user_id: Uuid,
    ) -> Result<Vec<RepositoryAccess>, StoreError>;

    /// Check that the backing database is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
