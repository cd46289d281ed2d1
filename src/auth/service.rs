//! The login state machine.
//!
//! One login attempt runs inside one keyed transaction. Policy outcomes
//! (unknown account, locked account, bad password, scope denial) commit so the
//! failed-attempt bookkeeping is kept; any store failure rolls back and is
//! reported as an internal error.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::session::{self, SessionRequest};
use super::{
    scope_hash, Argon2Verifier, AuthConfig, Authenticator, CachedScopeAuthorizer,
    CredentialVerifier, DormantScopes, LoginOutcome, LoginRequest, LoginResult, LoginStatus,
    ScopeAuthorizer, ACCOUNT_LOCKED_MESSAGE, INVALID_CREDENTIALS_MESSAGE, NOT_AUTHORIZED_MESSAGE,
    NO_ACCOUNT_MESSAGE,
};
use crate::store::{AuthStore, LockReason, StoreError};
use crate::tx::{TransactionManager, TxError, TxToken};

#[derive(Debug, thiserror::Error)]
enum LoginError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("credential verification task failed: {0}")]
    Verify(#[from] tokio::task::JoinError),
    #[error("login transaction {0} is not registered")]
    MissingTransaction(String),
}

/// Key under which a login attempt opens its transaction: one per
/// (username, user agent) pair.
#[must_use]
pub fn transaction_key(username: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_agent.as_bytes());
    format!("login:{}", hex::encode(hasher.finalize()))
}

pub struct AuthService<S: AuthStore> {
    store: Arc<S>,
    transactions: Arc<TransactionManager<S>>,
    verifier: Arc<dyn CredentialVerifier>,
    scopes: Arc<dyn ScopeAuthorizer>,
    config: AuthConfig,
}

impl<S: AuthStore> AuthService<S> {
    #[must_use]
    pub fn new(store: Arc<S>, config: AuthConfig) -> Self {
        let scopes: Arc<dyn ScopeAuthorizer> = if config.scope_authorization() {
            Arc::new(CachedScopeAuthorizer::new(Arc::clone(&store)))
        } else {
            Arc::new(DormantScopes)
        };
        let transactions =
            TransactionManager::new(Arc::clone(&store)).with_timeout(config.store_timeout());
        Self {
            store,
            transactions: Arc::new(transactions),
            verifier: Arc::new(Argon2Verifier::new()),
            scopes,
            config,
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn with_scope_authorizer(mut self, scopes: Arc<dyn ScopeAuthorizer>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn transactions(&self) -> &TransactionManager<S> {
        &self.transactions
    }

    /// Run one login attempt. Never fails: every error is folded into the
    /// returned [`LoginResult`].
    #[instrument(skip_all, fields(username = %request.username))]
    pub async fn authenticate_user(
        &self,
        request: &LoginRequest,
        user_agent: &str,
        client_ip: &str,
    ) -> LoginOutcome {
        let key = transaction_key(&request.username, user_agent);
        let token = match self.transactions.begin(&key).await {
            Ok(token) => token,
            Err(err) => {
                error!("Unable to start login transaction: {err}");
                return LoginOutcome::rejected(LoginResult::internal_error());
            }
        };
        let mut pending = PendingRollback::new(Arc::clone(&self.transactions), key.clone(), token);

        let outcome = match self.login(&key, request, user_agent, client_ip).await {
            Ok(outcome) => match self.transactions.commit(&key).await {
                Ok(()) => outcome,
                Err(err) => {
                    error!("Failed to commit login transaction: {err}");
                    LoginOutcome::rejected(LoginResult::internal_error())
                }
            },
            Err(err) => {
                error!("Login aborted: {err}");
                if let Err(err) = self.transactions.rollback(&key).await {
                    error!("Failed to roll back login transaction: {err}");
                }
                LoginOutcome::rejected(LoginResult::internal_error())
            }
        };
        pending.disarm();
        outcome
    }

    async fn login(
        &self,
        key: &str,
        request: &LoginRequest,
        user_agent: &str,
        client_ip: &str,
    ) -> Result<LoginOutcome, LoginError> {
        let mut tx = self
            .transactions
            .transaction(key)
            .await
            .ok_or_else(|| LoginError::MissingTransaction(key.to_string()))?;
        let username = request.username.as_str();

        let account = self
            .bounded("user_account", self.store.user_account(Some(&mut *tx), username))
            .await?;
        let Some(mut account) = account else {
            info!("Login rejected: no account");
            return Ok(LoginOutcome::rejected(LoginResult::forbidden(
                NO_ACCOUNT_MESSAGE,
            )));
        };

        if account.locked {
            warn!(lock_reason = ?account.lock_reason, "Login rejected: account locked");
            return Ok(LoginOutcome::rejected(LoginResult::forbidden(
                ACCOUNT_LOCKED_MESSAGE,
            )));
        }

        let credential = self
            .bounded("credential", self.store.credential(Some(&mut *tx), account.id))
            .await?;
        let verifier = Arc::clone(&self.verifier);
        let password = request.password.clone();
        let matched = tokio::task::spawn_blocking(move || {
            verifier.verify(&password, &credential.salt, &credential.hash)
        })
        .await?;

        if !matched {
            self.bounded(
                "record_failed_attempt",
                self.store.record_failed_attempt(Some(&mut *tx), username),
            )
            .await?;

            if account.failed_attempts + 1 > self.config.max_failed_login_attempts() {
                self.bounded(
                    "lock_account",
                    self.store.lock_account(
                        Some(&mut *tx),
                        username,
                        LockReason::FailedLoginAttempts,
                    ),
                )
                .await?;
                warn!(
                    failed_attempts = account.failed_attempts + 1,
                    "Account locked after too many failed login attempts"
                );
                return Ok(LoginOutcome::rejected(LoginResult::forbidden(
                    ACCOUNT_LOCKED_MESSAGE,
                )));
            }

            info!("Login rejected: invalid credentials");
            return Ok(LoginOutcome::rejected(LoginResult::forbidden(
                INVALID_CREDENTIALS_MESSAGE,
            )));
        }

        self.bounded(
            "unlock_account",
            self.store.unlock_account(Some(&mut *tx), username),
        )
        .await?;
        account.locked = false;
        account.lock_reason = None;
        account.failed_attempts = 0;

        let role = self
            .bounded("role", self.store.role(Some(&mut *tx), account.id))
            .await?;

        let authorized_scopes = match self
            .bounded("scope_role_bindings", async {
                Ok(self.scopes.authorize(&role, &request.scopes).await)
            })
            .await?
        {
            None => Vec::new(),
            Some(mut granted) => {
                granted.sort();
                granted.dedup();
                if !request.scopes.is_empty() && granted.is_empty() {
                    info!(role = %role, "Login rejected: requested scopes not authorized");
                    return Ok(LoginOutcome::rejected(LoginResult::forbidden(
                        NOT_AUTHORIZED_MESSAGE,
                    )));
                }
                granted
            }
        };
        let hash = scope_hash(&authorized_scopes);

        let now = Utc::now();
        let existing = self
            .bounded(
                "auth_session",
                self.store.auth_session(Some(&mut *tx), &hash, account.id),
            )
            .await?;
        let reuse_guard = Duration::seconds(self.config.session_reuse_guard_seconds());

        let (session_id, expires_at) = match existing {
            Some(current) if session::is_reusable(&current, now, reuse_guard) => {
                debug!("Reusing session {}", current.session_id);
                (current.session_id, current.expires_at)
            }
            stale => {
                if let Some(stale) = stale {
                    debug!("Replacing session {} close to expiry", stale.session_id);
                    self.bounded(
                        "remove_auth_session",
                        self.store
                            .remove_auth_session(Some(&mut *tx), &stale.session_id),
                    )
                    .await?;
                }

                let issued = session::issue(
                    &SessionRequest {
                        user_id: account.id,
                        scope_hash: &hash,
                        user_agent,
                        client_ip,
                    },
                    now,
                    Duration::seconds(self.config.session_expiry_seconds()),
                );
                self.bounded(
                    "persist_auth_session",
                    self.store.persist_auth_session(Some(&mut *tx), &issued),
                )
                .await?;
                if !authorized_scopes.is_empty() {
                    self.bounded(
                        "persist_session_scope_binding",
                        self.store.persist_session_scope_binding(
                            Some(&mut *tx),
                            &authorized_scopes,
                            &issued.session_id,
                        ),
                    )
                    .await?;
                }
                debug!("Issued session {}", issued.session_id);
                (issued.session_id, issued.expires_at)
            }
        };

        let namespaces = self
            .bounded(
                "namespace_access",
                self.store.namespace_access(Some(&mut *tx), account.id),
            )
            .await?;
        let repositories = self
            .bounded(
                "repository_access",
                self.store.repository_access(Some(&mut *tx), account.id),
            )
            .await?;

        info!(role = %role, "Login succeeded");
        Ok(LoginOutcome {
            account: Some(account),
            namespaces,
            repositories,
            result: LoginResult {
                success: true,
                status: LoginStatus::Ok,
                error_message: String::new(),
                session_id,
                authorized_scopes,
                expires_at,
                role,
            },
        })
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.config.store_timeout(), fut)
            .await
            .unwrap_or_else(|_| Err(StoreError::timeout(operation)))
    }
}

#[async_trait]
impl<S: AuthStore> Authenticator for AuthService<S> {
    async fn authenticate_user(
        &self,
        request: &LoginRequest,
        user_agent: &str,
        client_ip: &str,
    ) -> LoginOutcome {
        AuthService::authenticate_user(self, request, user_agent, client_ip).await
    }

    fn session_expiry_seconds(&self) -> i64 {
        self.config.session_expiry_seconds()
    }
}

/// Rolls back the login transaction if the attempt is dropped before it is
/// finalized, so an abandoned request does not keep its key open. The rollback is
/// tied to the token of this attempt and leaves a later attempt on the same key alone.
struct PendingRollback<S: AuthStore> {
    transactions: Arc<TransactionManager<S>>,
    key: String,
    token: TxToken,
    armed: bool,
}

impl<S: AuthStore> PendingRollback<S> {
    fn new(transactions: Arc<TransactionManager<S>>, key: String, token: TxToken) -> Self {
        Self {
            transactions,
            key,
            token,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: AuthStore> Drop for PendingRollback<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transactions = Arc::clone(&self.transactions);
        let key = std::mem::take(&mut self.key);
        let token = self.token;
        warn!("Login attempt abandoned, rolling back transaction {key}");
        handle.spawn(async move {
            match transactions.rollback_if_current(&key, token).await {
                Ok(()) | Err(TxError::NotFound { .. }) => {}
                Err(err) => warn!("Rollback of abandoned login failed: {err}"),
            }
        });
    }
}
