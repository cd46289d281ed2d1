//! In-process store with snapshot transactions.
//!
//! A transaction works on a private copy of the tables; commit publishes the copy
//! and rollback drops it. Concurrent transactions are last-commit-wins, so this
//! store is meant for tests and single-node local runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{
    AuthSession, AuthStore, Credential, LockReason, NamespaceAccess, RepositoryAccess,
    ScopeRoleBinding, StoreError, StoreErrorKind, UserAccount,
};
use crate::tx::TransactionBackend;

#[derive(Clone, Debug, Default)]
struct Tables {
    users: HashMap<String, UserAccount>,
    credentials: HashMap<Uuid, Credential>,
    roles: HashMap<Uuid, String>,
    scope_roles: Vec<ScopeRoleBinding>,
    sessions: HashMap<String, AuthSession>,
    session_scopes: Vec<(String, String)>,
    namespace_access: Vec<NamespaceAccess>,
    repository_access: Vec<RepositoryAccess>,
}

#[derive(Debug)]
pub struct MemoryTx {
    tables: Tables,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failures: Mutex<HashSet<String>>,
    writes: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(operation: &'static str, what: impl std::fmt::Display) -> StoreError {
    StoreError::new(StoreErrorKind::NotFound, operation, format!("{what} not found"))
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `operation` fail with an `Unknown` store error.
    ///
    /// Operation names are the trait method names plus `BEGIN`, `COMMIT` and `ROLLBACK`.
    pub fn fail_operation(&self, operation: &str) {
        lock(&self.failures).insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Number of write statements executed, committed or not.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Provision an account with its credential and role.
    pub fn add_user(&self, username: &str, hash: &str, salt: &str, role: &str) -> UserAccount {
        let account = UserAccount {
            id: Uuid::new_v4(),
            username: username.to_string(),
            locked: false,
            lock_reason: None,
            failed_attempts: 0,
        };
        let mut tables = lock(&self.tables);
        tables.users.insert(username.to_string(), account.clone());
        tables.credentials.insert(
            account.id,
            Credential {
                hash: hash.to_string(),
                salt: salt.to_string(),
            },
        );
        tables.roles.insert(account.id, role.to_string());
        account
    }

    pub fn set_failed_attempts(&self, username: &str, failed_attempts: i32) {
        if let Some(account) = lock(&self.tables).users.get_mut(username) {
            account.failed_attempts = failed_attempts;
        }
    }

    pub fn set_locked(&self, username: &str, reason: Option<LockReason>) {
        if let Some(account) = lock(&self.tables).users.get_mut(username) {
            account.locked = reason.is_some();
            account.lock_reason = reason;
        }
    }

    pub fn add_scope_role_binding(&self, scope_name: &str, role_name: &str) {
        lock(&self.tables).scope_roles.push(ScopeRoleBinding {
            scope_name: scope_name.to_string(),
            role_name: role_name.to_string(),
        });
    }

    pub fn insert_session(&self, session: AuthSession) {
        lock(&self.tables)
            .sessions
            .insert(session.session_id.clone(), session);
    }

    pub fn grant_namespace_access(&self, user_id: Uuid, namespace: &str, access_level: &str) {
        lock(&self.tables).namespace_access.push(NamespaceAccess {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            resource_id: Uuid::new_v4(),
            user_id,
            access_level: access_level.to_string(),
            granted_by: "admin".to_string(),
            created_at: Utc::now(),
            updated_at: None,
        });
    }

    pub fn grant_repository_access(
        &self,
        user_id: Uuid,
        namespace: &str,
        repository: &str,
        access_level: &str,
    ) {
        lock(&self.tables).repository_access.push(RepositoryAccess {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            repository: repository.to_string(),
            resource_id: Uuid::new_v4(),
            user_id,
            access_level: access_level.to_string(),
            granted_by: "admin".to_string(),
            created_at: Utc::now(),
            updated_at: None,
        });
    }

    #[must_use]
    pub fn user(&self, username: &str) -> Option<UserAccount> {
        lock(&self.tables).users.get(username).cloned()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<AuthSession> {
        lock(&self.tables).sessions.values().cloned().collect()
    }

    /// Scope names bound to `session_id`, in insertion order.
    #[must_use]
    pub fn session_scopes(&self, session_id: &str) -> Vec<String> {
        lock(&self.tables)
            .session_scopes
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, scope)| scope.clone())
            .collect()
    }

    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if lock(&self.failures).contains(operation) {
            return Err(StoreError::new(
                StoreErrorKind::Unknown,
                operation,
                "injected failure",
            ));
        }
        Ok(())
    }

    fn read<R>(
        &self,
        tx: Option<&mut MemoryTx>,
        operation: &'static str,
        f: impl FnOnce(&Tables) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check(operation)?;
        match tx {
            Some(tx) => f(&tx.tables),
            None => f(&lock(&self.tables)),
        }
    }

    fn write<R>(
        &self,
        tx: Option<&mut MemoryTx>,
        operation: &'static str,
        f: impl FnOnce(&mut Tables) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check(operation)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        match tx {
            Some(tx) => f(&mut tx.tables),
            None => f(&mut lock(&self.tables)),
        }
    }
}

#[async_trait]
impl TransactionBackend for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        self.check("BEGIN")?;
        Ok(MemoryTx {
            tables: lock(&self.tables).clone(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), StoreError> {
        self.check("COMMIT")?;
        *lock(&self.tables) = tx.tables;
        Ok(())
    }

    async fn rollback(&self, _tx: MemoryTx) -> Result<(), StoreError> {
        self.check("ROLLBACK")
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn user_account(
        &self,
        tx: Option<&mut MemoryTx>,
        username: &str,
    ) -> Result<Option<UserAccount>, StoreError> {
        self.read(tx, "user_account", |t| Ok(t.users.get(username).cloned()))
    }

    async fn credential(
        &self,
        tx: Option<&mut MemoryTx>,
        user_id: Uuid,
    ) -> Result<Credential, StoreError> {
        self.read(tx, "credential", |t| {
            t.credentials
                .get(&user_id)
                .cloned()
                .ok_or_else(|| not_found("credential", user_id))
        })
    }

    async fn record_failed_attempt(
        &self,
        tx: Option<&mut MemoryTx>,
        username: &str,
    ) -> Result<(), StoreError> {
        self.write(tx, "record_failed_attempt", |t| {
            if let Some(account) = t.users.get_mut(username) {
                account.failed_attempts += 1;
            }
            Ok(())
        })
    }

    async fn lock_account(
        &self,
        tx: Option<&mut MemoryTx>,
        username: &str,
        reason: LockReason,
    ) -> Result<(), StoreError> {
        self.write(tx, "lock_account", |t| {
            if let Some(account) = t.users.get_mut(username) {
                account.locked = true;
                account.lock_reason = Some(reason);
            }
            Ok(())
        })
    }

    async fn unlock_account(
        &self,
        tx: Option<&mut MemoryTx>,
        username: &str,
    ) -> Result<(), StoreError> {
        self.write(tx, "unlock_account", |t| {
            if let Some(account) = t.users.get_mut(username) {
                account.locked = false;
                account.lock_reason = None;
                account.failed_attempts = 0;
            }
            Ok(())
        })
    }

    async fn role(&self, tx: Option<&mut MemoryTx>, user_id: Uuid) -> Result<String, StoreError> {
        self.read(tx, "role", |t| {
            t.roles
                .get(&user_id)
                .cloned()
                .ok_or_else(|| not_found("role", user_id))
        })
    }

    async fn scope_role_bindings(&self) -> Result<Vec<ScopeRoleBinding>, StoreError> {
        self.read(None, "scope_role_bindings", |t| Ok(t.scope_roles.clone()))
    }

    async fn auth_session(
        &self,
        tx: Option<&mut MemoryTx>,
        scope_hash: &str,
        user_id: Uuid,
    ) -> Result<Option<AuthSession>, StoreError> {
        self.read(tx, "auth_session", |t| {
            Ok(t.sessions
                .values()
                .filter(|s| s.user_id == user_id && s.scope_hash == scope_hash)
                .max_by_key(|s| s.issued_at)
                .cloned())
        })
    }

    async fn remove_auth_session(
        &self,
        tx: Option<&mut MemoryTx>,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.write(tx, "remove_auth_session", |t| {
            t.sessions.remove(session_id);
            t.session_scopes.retain(|(id, _)| id != session_id);
            Ok(())
        })
    }

    async fn persist_auth_session(
        &self,
        tx: Option<&mut MemoryTx>,
        session: &AuthSession,
    ) -> Result<(), StoreError> {
        self.write(tx, "persist_auth_session", |t| {
            if t.sessions.contains_key(&session.session_id) {
                return Err(StoreError::new(
                    StoreErrorKind::UniqueViolation,
                    "persist_auth_session",
                    format!("session {} already exists", session.session_id),
                ));
            }
            t.sessions
                .insert(session.session_id.clone(), session.clone());
            Ok(())
        })
    }

    async fn persist_session_scope_binding(
        &self,
        tx: Option<&mut MemoryTx>,
        scopes: &[String],
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.write(tx, "persist_session_scope_binding", |t| {
            if !t.sessions.contains_key(session_id) {
                return Err(StoreError::new(
                    StoreErrorKind::ForeignKeyViolation,
                    "persist_session_scope_binding",
                    format!("session {session_id} does not exist"),
                ));
            }
            t.session_scopes.extend(
                scopes
                    .iter()
                    .map(|scope| (session_id.to_string(), scope.clone())),
            );
            Ok(())
        })
    }

    async fn namespace_access(
        &self,
        tx: Option<&mut MemoryTx>,
        user_id: Uuid,
    ) -> Result<Vec<NamespaceAccess>, StoreError> {
        self.read(tx, "namespace_access", |t| {
            Ok(t.namespace_access
                .iter()
                .filter(|a| a.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    async fn repository_access(
        &self,
        tx: Option<&mut MemoryTx>,
        user_id: Uuid,
    ) -> Result<Vec<RepositoryAccess>, StoreError> {
        self.read(tx, "repository_access", |t| {
            Ok(t.repository_access
                .iter()
                .filter(|a| a.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check("ping")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_in_transaction_are_invisible_until_commit() {
        let store = MemoryStore::new();
        store.add_user("alice", "hash", "salt", "Developer");

        let mut tx = store.begin().await.expect("begin");
        store
            .record_failed_attempt(Some(&mut tx), "alice")
            .await
            .expect("record");

        assert_eq!(store.user("alice").map(|u| u.failed_attempts), Some(0));
        let inside = store
            .user_account(Some(&mut tx), "alice")
            .await
            .expect("lookup");
        assert_eq!(inside.map(|u| u.failed_attempts), Some(1));

        store.commit(tx).await.expect("commit");
        assert_eq!(store.user("alice").map(|u| u.failed_attempts), Some(1));
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        store.add_user("alice", "hash", "salt", "Developer");

        let mut tx = store.begin().await.expect("begin");
        store
            .lock_account(Some(&mut tx), "alice", LockReason::AdminLocked)
            .await
            .expect("lock");
        store.rollback(tx).await.expect("rollback");

        let account = store.user("alice").expect("account");
        assert!(!account.locked);
        assert_eq!(account.lock_reason, None);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn standalone_calls_apply_immediately() {
        let store = MemoryStore::new();
        store.add_user("alice", "hash", "salt", "Developer");
        store.set_failed_attempts("alice", 3);
        store.set_locked("alice", Some(LockReason::FailedLoginAttempts));

        store.unlock_account(None, "alice").await.expect("unlock");

        let account = store.user("alice").expect("account");
        assert!(!account.locked);
        assert_eq!(account.failed_attempts, 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_store_errors() {
        let store = MemoryStore::new();
        store.fail_operation("user_account");

        let err = store
            .user_account(None, "alice")
            .await
            .expect_err("injected failure");
        assert_eq!(err.operation, "user_account");
        assert_eq!(err.kind, StoreErrorKind::Unknown);

        store.clear_failures();
        assert!(store.user_account(None, "alice").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn scope_bindings_require_existing_session() {
        let store = MemoryStore::new();
        let err = store
            .persist_session_scope_binding(None, &["pull".to_string()], "missing")
            .await
            .expect_err("missing session");
        assert_eq!(err.kind, StoreErrorKind::ForeignKeyViolation);
    }
}
