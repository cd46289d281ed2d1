//! Postgres implementation of the auth store.

use async_trait::async_trait;
use sqlx::{
    pool::PoolConnection, postgres::PgRow, Connection, PgConnection, PgPool, Postgres, Row,
    Transaction,
};
use std::ops::{Deref, DerefMut};
use tracing::{error, info_span, Instrument, Span};
use uuid::Uuid;

use super::{
    AuthSession, AuthStore, Credential, LockReason, NamespaceAccess, RepositoryAccess,
    ScopeRoleBinding, StoreError, UserAccount,
};
use crate::tx::TransactionBackend;

const GET_USER_ACCOUNT: &str = r"
    SELECT id, username, locked, lock_reason, failed_attempts
    FROM user_accounts
    WHERE username = $1
";

const GET_CREDENTIAL: &str = r"
    SELECT password_hash, salt
    FROM user_credentials
    WHERE user_id = $1
";

const RECORD_FAILED_ATTEMPT: &str = r"
    UPDATE user_accounts
    SET failed_attempts = failed_attempts + 1,
        updated_at = NOW()
    WHERE username = $1
";

const LOCK_ACCOUNT: &str = r"
    UPDATE user_accounts
    SET locked = TRUE,
        lock_reason = $2,
        locked_at = NOW(),
        updated_at = NOW()
    WHERE username = $1
";

const UNLOCK_ACCOUNT: &str = r"
    UPDATE user_accounts
    SET locked = FALSE,
        lock_reason = NULL,
        locked_at = NULL,
        failed_attempts = 0,
        updated_at = NOW()
    WHERE username = $1
";

const GET_ROLE: &str = "SELECT role_name FROM user_roles WHERE user_id = $1";

const GET_ALL_SCOPE_ROLE_BINDINGS: &str = "SELECT scope_name, role_name FROM scope_role_bindings";

const GET_AUTH_SESSION: &str = r"
    SELECT session_id, user_id, scope_hash, issued_at, expires_at, user_agent, client_ip, grant_type
    FROM auth_sessions
    WHERE scope_hash = $1 AND user_id = $2
    ORDER BY issued_at DESC
    LIMIT 1
";

const REMOVE_AUTH_SESSION: &str = "DELETE FROM auth_sessions WHERE session_id = $1";

const PERSIST_AUTH_SESSION: &str = r"
    INSERT INTO auth_sessions
        (session_id, user_id, scope_hash, issued_at, expires_at, user_agent, client_ip, grant_type)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
";

const PERSIST_SESSION_SCOPE: &str = r"
    INSERT INTO auth_session_scopes (session_id, scope_name)
    VALUES ($1, $2)
";

const GET_NAMESPACE_ACCESS: &str = r"
    SELECT a.id, n.name AS namespace, a.resource_id, a.user_id, a.access_level,
           a.granted_by, a.created_at, a.updated_at
    FROM resource_access a
    JOIN namespaces n ON n.id = a.resource_id
    WHERE a.user_id = $1 AND a.resource_type = 'namespace'
    ORDER BY n.name
";

const GET_REPOSITORY_ACCESS: &str = r"
    SELECT a.id, n.name AS namespace, r.name AS repository, a.resource_id, a.user_id,
           a.access_level, a.granted_by, a.created_at, a.updated_at
    FROM resource_access a
    JOIN repositories r ON r.id = a.resource_id
    JOIN namespaces n ON n.id = r.namespace_id
    WHERE a.user_id = $1 AND a.resource_type = 'repository'
    ORDER BY n.name, r.name
";

fn query_span(statement: &'static str) -> Span {
    let operation = statement.split_whitespace().next().unwrap_or_default();
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Either the caller's transaction or a connection checked out for one statement.
enum Conn<'a> {
    Tx(&'a mut PgConnection),
    Pooled(PoolConnection<Postgres>),
}

impl Deref for Conn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Self::Tx(conn) => &**conn,
            Self::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Self::Tx(conn) => &mut **conn,
            Self::Pooled(conn) => &mut **conn,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn<'a>(
        &self,
        tx: Option<&'a mut Transaction<'static, Postgres>>,
        operation: &'static str,
    ) -> Result<Conn<'a>, StoreError> {
        match tx {
            Some(tx) => Ok(Conn::Tx(&mut **tx)),
            None => self.pool.acquire().await.map(Conn::Pooled).map_err(|err| {
                error!("Unable to acquire database connection: {err}");
                StoreError::classify(&err, operation)
            }),
        }
    }

    async fn execute(
        &self,
        tx: Option<&mut Transaction<'static, Postgres>>,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        statement: &'static str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn(tx, operation).await?;
        query
            .execute(&mut *conn)
            .instrument(query_span(statement))
            .await
            .map(|result| result.rows_affected())
            .map_err(|err| {
                error!("Error occurred when executing {operation}: {err}");
                StoreError::classify(&err, operation)
            })
    }
}

fn decode<T>(row: &PgRow, column: &str, operation: &'static str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(|err| {
        error!("Error occurred when reading column {column} of {operation}: {err}");
        StoreError::classify(&err, operation)
    })
}

#[async_trait]
impl TransactionBackend for PgStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|err| StoreError::classify(&err, "BEGIN"))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|err| StoreError::classify(&err, "COMMIT"))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback()
            .await
            .map_err(|err| StoreError::classify(&err, "ROLLBACK"))
    }
}

#[async_trait]
impl AuthStore for PgStore {
    async fn user_account(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
    ) -> Result<Option<UserAccount>, StoreError> {
        const OP: &str = "user_account";
        let mut conn = self.conn(tx, OP).await?;
        let row = sqlx::query(GET_USER_ACCOUNT)
            .bind(username)
            .fetch_optional(&mut *conn)
            .instrument(query_span(GET_USER_ACCOUNT))
            .await
            .map_err(|err| {
                error!("Error occurred when retrieving user account {username}: {err}");
                StoreError::classify(&err, OP)
            })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let lock_reason: Option<i16> = decode(&row, "lock_reason", OP)?;
        Ok(Some(UserAccount {
            id: decode(&row, "id", OP)?,
            username: decode(&row, "username", OP)?,
            locked: decode(&row, "locked", OP)?,
            lock_reason: lock_reason.and_then(LockReason::from_code),
            failed_attempts: decode(&row, "failed_attempts", OP)?,
        }))
    }

    async fn credential(
        &self,
        tx: Option<&mut Self::Tx>,
        user_id: Uuid,
    ) -> Result<Credential, StoreError> {
        const OP: &str = "credential";
        let mut conn = self.conn(tx, OP).await?;
        let row = sqlx::query(GET_CREDENTIAL)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .instrument(query_span(GET_CREDENTIAL))
            .await
            .map_err(|err| {
                error!("Error occurred when retrieving credential of user {user_id}: {err}");
                StoreError::classify(&err, OP)
            })?;
        Ok(Credential {
            hash: decode(&row, "password_hash", OP)?,
            salt: decode(&row, "salt", OP)?,
        })
    }

    async fn record_failed_attempt(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(RECORD_FAILED_ATTEMPT).bind(username);
        self.execute(tx, "record_failed_attempt", query, RECORD_FAILED_ATTEMPT)
            .await
            .map(|_| ())
    }

    async fn lock_account(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
        reason: LockReason,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(LOCK_ACCOUNT).bind(username).bind(reason.code());
        self.execute(tx, "lock_account", query, LOCK_ACCOUNT)
            .await
            .map(|_| ())
    }

    async fn unlock_account(
        &self,
        tx: Option<&mut Self::Tx>,
        username: &str,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(UNLOCK_ACCOUNT).bind(username);
        self.execute(tx, "unlock_account", query, UNLOCK_ACCOUNT)
            .await
            .map(|_| ())
    }

    async fn role(&self, tx: Option<&mut Self::Tx>, user_id: Uuid) -> Result<String, StoreError> {
        const OP: &str = "role";
        let mut conn = self.conn(tx, OP).await?;
        let row = sqlx::query(GET_ROLE)
            .bind(user_id)
            .fetch_one(&mut *conn)
            .instrument(query_span(GET_ROLE))
            .await
            .map_err(|err| {
                error!("Error occurred when retrieving role of user {user_id}: {err}");
                StoreError::classify(&err, OP)
            })?;
        decode(&row, "role_name", OP)
    }

    async fn scope_role_bindings(&self) -> Result<Vec<ScopeRoleBinding>, StoreError> {
        const OP: &str = "scope_role_bindings";
        let rows = sqlx::query(GET_ALL_SCOPE_ROLE_BINDINGS)
            .fetch_all(&self.pool)
            .instrument(query_span(GET_ALL_SCOPE_ROLE_BINDINGS))
            .await
            .map_err(|err| {
                error!("Error occurred when retrieving scope role bindings: {err}");
                StoreError::classify(&err, OP)
            })?;
        rows.iter()
            .map(|row| -> Result<ScopeRoleBinding, StoreError> {
                Ok(ScopeRoleBinding {
                    scope_name: decode(row, "scope_name", OP)?,
                    role_name: decode(row, "role_name", OP)?,
                })
            })
            .collect()
    }

    async fn auth_session(
        &self,
        tx: Option<&mut Self::Tx>,
        scope_hash: &str,
        user_id: Uuid,
    ) -> Result<Option<AuthSession>, StoreError> {
        const OP: &str = "auth_session";
        let mut conn = self.conn(tx, OP).await?;
        let row = sqlx::query(GET_AUTH_SESSION)
            .bind(scope_hash)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .instrument(query_span(GET_AUTH_SESSION))
            .await
            .map_err(|err| {
                error!(
                    "Error occurred when retrieving auth session by scope hash({scope_hash}) and user({user_id}): {err}"
                );
                StoreError::classify(&err, OP)
            })?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AuthSession {
            session_id: decode(&row, "session_id", OP)?,
            user_id: decode(&row, "user_id", OP)?,
            scope_hash: decode(&row, "scope_hash", OP)?,
            issued_at: decode(&row, "issued_at", OP)?,
            expires_at: decode(&row, "expires_at", OP)?,
            user_agent: decode(&row, "user_agent", OP)?,
            client_ip: decode(&row, "client_ip", OP)?,
            grant_type: decode(&row, "grant_type", OP)?,
        }))
    }

    async fn remove_auth_session(
        &self,
        tx: Option<&mut Self::Tx>,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(REMOVE_AUTH_SESSION).bind(session_id);
        self.execute(tx, "remove_auth_session", query, REMOVE_AUTH_SESSION)
            .await
            .map(|_| ())
    }

    async fn persist_auth_session(
        &self,
        tx: Option<&mut Self::Tx>,
        session: &AuthSession,
    ) -> Result<(), StoreError> {
        let query = sqlx::query(PERSIST_AUTH_SESSION)
            .bind(&session.session_id)
            .bind(session.user_id)
            .bind(&session.scope_hash)
            .bind(session.issued_at)
            .bind(session.expires_at)
            .bind(&session.user_agent)
            .bind(&session.client_ip)
            .bind(&session.grant_type);
        self.execute(tx, "persist_auth_session", query, PERSIST_AUTH_SESSION)
            .await
            .map(|_| ())
    }

    async fn persist_session_scope_binding(
        &self,
        tx: Option<&mut Self::Tx>,
        scopes: &[String],
        session_id: &str,
    ) -> Result<(), StoreError> {
        const OP: &str = "persist_session_scope_binding";
        let mut conn = self.conn(tx, OP).await?;
        for scope in scopes {
            sqlx::query(PERSIST_SESSION_SCOPE)
                .bind(session_id)
                .bind(scope)
                .execute(&mut *conn)
                .instrument(query_span(PERSIST_SESSION_SCOPE))
                .await
                .map_err(|err| {
                    error!("Error occurred when persisting scope {scope} of session {session_id}: {err}");
                    StoreError::classify(&err, OP)
                })?;
        }
        Ok(())
    }

    async fn namespace_access(
        &self,
        tx: Option<&mut Self::Tx>,
        user_id: Uuid,
    ) -> Result<Vec<NamespaceAccess>, StoreError> {
        const OP: &str = "namespace_access";
        let mut conn = self.conn(tx, OP).await?;
        let rows = sqlx::query(GET_NAMESPACE_ACCESS)
            .bind(user_id)
            .fetch_all(&mut *conn)
            .instrument(query_span(GET_NAMESPACE_ACCESS))
            .await
            .map_err(|err| {
                error!("Error occurred when retrieving namespace access of user {user_id}: {err}");
                StoreError::classify(&err, OP)
            })?;
        rows.iter()
            .map(|row| -> Result<NamespaceAccess, StoreError> {
                Ok(NamespaceAccess {
                    id: decode(row, "id", OP)?,
                    namespace: decode(row, "namespace", OP)?,
                    resource_id: decode(row, "resource_id", OP)?,
                    user_id: decode(row, "user_id", OP)?,
                    access_level: decode(row, "access_level", OP)?,
                    granted_by: decode(row, "granted_by", OP)?,
                    created_at: decode(row, "created_at", OP)?,
                    updated_at: decode(row, "updated_at", OP)?,
                })
            })
            .collect()
    }

    async fn repository_access(
        &self,
        tx: Option<&mut Self::Tx>,
        user_id: Uuid,
    ) -> Result<Vec<RepositoryAccess>, StoreError> {
        const OP: &str = "repository_access";
        let mut conn = self.conn(tx, OP).await?;
        let rows = sqlx::query(GET_REPOSITORY_ACCESS)
            .bind(user_id)
            .fetch_all(&mut *conn)
            .instrument(query_span(GET_REPOSITORY_ACCESS))
            .await
            .map_err(|err| {
                error!("Error occurred when retrieving repository access of user {user_id}: {err}");
                StoreError::classify(&err, OP)
            })?;
        rows.iter()
            .map(|row| -> Result<RepositoryAccess, StoreError> {
                Ok(RepositoryAccess {
                    id: decode(row, "id", OP)?,
                    namespace: decode(row, "namespace", OP)?,
                    repository: decode(row, "repository", OP)?,
                    resource_id: decode(row, "resource_id", OP)?,
                    user_id: decode(row, "user_id", OP)?,
                    access_level: decode(row, "access_level", OP)?,
                    granted_by: decode(row, "granted_by", OP)?,
                    created_at: decode(row, "created_at", OP)?,
                    updated_at: decode(row, "updated_at", OP)?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let acquire_span = info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        );
        let mut conn = self
            .pool
            .acquire()
            .instrument(acquire_span)
            .await
            .map_err(|err| {
                error!("Failed to acquire database connection: {err}");
                StoreError::classify(&err, "ping")
            })?;
        let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
        conn.ping().instrument(ping_span).await.map_err(|err| {
            error!("Failed to ping database: {err}");
            StoreError::classify(&err, "ping")
        })
    }
}
