//! Keyed transaction manager.
//!
//! Maps a caller-chosen key to at most one open transaction. Each key owns its
//! own slot lock, so begin/commit/rollback/lookup on one key never wait on
//! another key. Registration is separate from that lock: opening a key that is
//! already registered fails immediately, even while the open transaction is in use.
//! A key is unregistered as soon as its transaction is taken for finalizing.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, error, warn};

use crate::store::StoreError;

/// Something that can open and finalize database transactions.
#[async_trait]
pub trait TransactionBackend: Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("transaction already open for key {key}")]
    AlreadyOpen { key: String },
    #[error("transaction already closed for key {key}")]
    NotFound { key: String },
    #[error("failed to create transaction for key {key}")]
    CreationFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to commit transaction for key {key}")]
    CommitFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to roll back transaction for key {key}")]
    RollbackFailed {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Identifies one registration of a key.
///
/// A key that is finalized and opened again gets a fresh token, so a caller that
/// still holds the old token cannot finalize the newer transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxToken(u64);

struct Slot<T> {
    token: TxToken,
    tx: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            tx: Arc::clone(&self.tx),
        }
    }
}

/// Exclusive access to the transaction registered under a key.
///
/// Holding the guard holds the key's lock: drop it before calling
/// [`TransactionManager::commit`] or [`TransactionManager::rollback`] on the same key.
/// A concurrent [`TransactionManager::begin`] on the key does not wait for it.
pub type TxGuard<T> = OwnedMappedMutexGuard<Option<T>, T>;

#[derive(Clone, Copy, Debug)]
enum Finalize {
    Commit,
    Rollback,
}

pub struct TransactionManager<B: TransactionBackend> {
    backend: Arc<B>,
    slots: DashMap<String, Slot<B::Tx>>,
    next_token: AtomicU64,
    timeout: Option<Duration>,
}

impl<B: TransactionBackend> TransactionManager<B> {
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slots: DashMap::new(),
            next_token: AtomicU64::new(1),
            timeout: None,
        }
    }

    /// Bound every backend call (begin, commit, rollback) by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Number of keys that currently hold a registration.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.slots.len()
    }

    /// Open a transaction under `key`.
    ///
    /// The key is claimed before the backend is asked for a transaction, so a
    /// concurrent `begin` on the same key fails at once instead of waiting.
    ///
    /// # Errors
    /// Returns `TxError::AlreadyOpen` if `key` already has a transaction; no second
    /// transaction is opened. Returns `TxError::CreationFailed` if the backend fails.
    pub async fn begin(&self, key: &str) -> Result<TxToken, TxError> {
        let token = TxToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let cell = Arc::new(Mutex::new(None));
        let mut guard = Arc::clone(&cell).lock_owned().await;

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(_) => {
                warn!("Transaction already open for key: {key}");
                return Err(TxError::AlreadyOpen {
                    key: key.to_string(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot { token, tx: cell });
            }
        }
        let claim = Claim {
            slots: &self.slots,
            key,
            token,
            held: true,
        };

        debug!("Starting new database transaction for key: {key}");
        match self.bounded("BEGIN", self.backend.begin()).await {
            Ok(tx) => {
                *guard = Some(tx);
                claim.keep();
                Ok(token)
            }
            Err(err) => {
                error!("Unable to create database transaction with key {key}: {err}");
                drop(claim);
                Err(TxError::CreationFailed {
                    key: key.to_string(),
                    source: err,
                })
            }
        }
    }

    /// Commit the transaction under `key`. The key is unregistered whatever the outcome.
    ///
    /// # Errors
    /// Returns `TxError::NotFound` if no transaction is open under `key`, or
    /// `TxError::CommitFailed` if the backend rejects the commit.
    pub async fn commit(&self, key: &str) -> Result<(), TxError> {
        self.finalize(key, None, Finalize::Commit).await
    }

    /// Roll back the transaction under `key`. The key is unregistered whatever the outcome.
    ///
    /// # Errors
    /// Returns `TxError::NotFound` if no transaction is open under `key`, or
    /// `TxError::RollbackFailed` if the backend rejects the rollback.
    pub async fn rollback(&self, key: &str) -> Result<(), TxError> {
        self.finalize(key, None, Finalize::Rollback).await
    }

    /// Roll back the transaction under `key` only if it is still the one `token`
    /// was issued for.
    ///
    /// # Errors
    /// Returns `TxError::NotFound` if `key` is closed or has been opened again
    /// since, or `TxError::RollbackFailed` if the backend rejects the rollback.
    pub async fn rollback_if_current(&self, key: &str, token: TxToken) -> Result<(), TxError> {
        self.finalize(key, Some(token), Finalize::Rollback).await
    }

    /// Current transaction under `key`, if any.
    pub async fn transaction(&self, key: &str) -> Option<TxGuard<B::Tx>> {
        let slot = self.slot(key)?;
        let guard = Arc::clone(&slot.tx).lock_owned().await;
        if !self.is_current(key, slot.token) {
            return None;
        }
        OwnedMutexGuard::try_map(guard, Option::as_mut).ok()
    }

    async fn finalize(
        &self,
        key: &str,
        expected: Option<TxToken>,
        action: Finalize,
    ) -> Result<(), TxError> {
        let slot = self
            .slot(key)
            .filter(|slot| expected.map_or(true, |token| slot.token == token));
        let Some(slot) = slot else {
            warn!("{action:?} is invoked on non-existent transaction: {key}");
            return Err(TxError::NotFound {
                key: key.to_string(),
            });
        };

        let mut guard = Arc::clone(&slot.tx).lock_owned().await;
        let taken = guard.take();
        // Unregister before the backend call so an abandoned finalize cannot
        // leave the key claimed.
        self.retire(key, slot.token);
        drop(guard);

        let Some(tx) = taken else {
            warn!("{action:?} is invoked on non-existent transaction: {key}");
            return Err(TxError::NotFound {
                key: key.to_string(),
            });
        };

        let result = match action {
            Finalize::Commit => self.bounded("COMMIT", self.backend.commit(tx)).await,
            Finalize::Rollback => self.bounded("ROLLBACK", self.backend.rollback(tx)).await,
        };

        result.map_err(|source| {
            error!("{action:?} failed with errors for key {key}: {source}");
            match action {
                Finalize::Commit => TxError::CommitFailed {
                    key: key.to_string(),
                    source,
                },
                Finalize::Rollback => TxError::RollbackFailed {
                    key: key.to_string(),
                    source,
                },
            }
        })
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| Err(StoreError::timeout(operation))),
            None => fut.await,
        }
    }

    fn slot(&self, key: &str) -> Option<Slot<B::Tx>> {
        self.slots.get(key).map(|entry| entry.value().clone())
    }

    fn is_current(&self, key: &str, token: TxToken) -> bool {
        self.slots
            .get(key)
            .is_some_and(|entry| entry.value().token == token)
    }

    fn retire(&self, key: &str, token: TxToken) {
        self.slots.remove_if(key, |_, slot| slot.token == token);
    }
}

/// Registration made by an in-flight `begin`; released unless kept.
struct Claim<'a, T> {
    slots: &'a DashMap<String, Slot<T>>,
    key: &'a str,
    token: TxToken,
    held: bool,
}

impl<T> Claim<'_, T> {
    fn keep(mut self) {
        self.held = false;
    }
}

impl<T> Drop for Claim<'_, T> {
    fn drop(&mut self) {
        if self.held {
            let token = self.token;
            self.slots.remove_if(self.key, |_, slot| slot.token == token);
        }
    }
}
