//! Authorization scope resolution and scope-set hashing.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::store::AuthStore;

/// Decides which of the requested scopes a role may use.
#[async_trait]
pub trait ScopeAuthorizer: Send + Sync {
    /// Authorized subset of `requested` for `role`, or `None` when scope
    /// authorization is disabled.
    async fn authorize(&self, role: &str, requested: &[String]) -> Option<Vec<String>>;
}

/// Scope authorization switched off: nothing is checked and no scopes are granted.
#[derive(Clone, Debug, Default)]
pub struct DormantScopes;

#[async_trait]
impl ScopeAuthorizer for DormantScopes {
    async fn authorize(&self, _role: &str, _requested: &[String]) -> Option<Vec<String>> {
        None
    }
}

/// Read-through cache of scope to role bindings.
///
/// All bindings are loaded on the first scope that misses the cache and kept for
/// the life of the process.
pub struct CachedScopeAuthorizer<S: AuthStore> {
    store: Arc<S>,
    cache: Mutex<HashMap<String, HashSet<String>>>,
}

impl<S: AuthStore> CachedScopeAuthorizer<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: AuthStore> ScopeAuthorizer for CachedScopeAuthorizer<S> {
    async fn authorize(&self, role: &str, requested: &[String]) -> Option<Vec<String>> {
        let mut cache = self.cache.lock().await;
        let mut authorized = Vec::new();
        for scope in requested {
            if !cache.contains_key(scope) {
                debug!("Scope {scope} not cached, loading scope role bindings");
                match self.store.scope_role_bindings().await {
                    Ok(bindings) => {
                        for binding in bindings {
                            cache
                                .entry(binding.scope_name)
                                .or_default()
                                .insert(binding.role_name);
                        }
                    }
                    Err(err) => {
                        error!("Failed to load scope role bindings: {err}");
                        continue;
                    }
                }
            }
            if cache.get(scope).is_some_and(|roles| roles.contains(role)) {
                authorized.push(scope.clone());
            }
        }
        Some(authorized)
    }
}

/// Order-insensitive digest of a scope set: de-duplicated, sorted, newline-joined,
/// SHA-256, lowercase hex.
#[must_use]
pub fn scope_hash(scopes: &[String]) -> String {
    let sorted: BTreeSet<&str> = scopes.iter().map(String::as_str).collect();
    let joined = sorted.into_iter().collect::<Vec<_>>().join("\n");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn scope_hash_ignores_order_and_duplicates() {
        assert_eq!(scope_hash(&scopes(&["b", "a"])), scope_hash(&scopes(&["a", "b"])));
        assert_eq!(
            scope_hash(&scopes(&["a", "b", "a"])),
            scope_hash(&scopes(&["b", "a"]))
        );
        assert_ne!(scope_hash(&scopes(&["a"])), scope_hash(&scopes(&["a", "b"])));
    }

    #[test]
    fn scope_hash_of_empty_set_is_digest_of_empty_string() {
        assert_eq!(
            scope_hash(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn dormant_scopes_never_authorize() {
        assert_eq!(DormantScopes.authorize("Admin", &scopes(&["pull"])).await, None);
    }

    #[tokio::test]
    async fn cached_authorizer_filters_by_role() {
        let store = Arc::new(MemoryStore::new());
        store.add_scope_role_binding("pull", "Developer");
        store.add_scope_role_binding("push", "Admin");
        let authorizer = CachedScopeAuthorizer::new(Arc::clone(&store));

        let granted = authorizer
            .authorize("Developer", &scopes(&["pull", "push", "unknown"]))
            .await;
        assert_eq!(granted, Some(scopes(&["pull"])));
    }

    #[tokio::test]
    async fn cached_authorizer_keeps_bindings_for_process_lifetime() {
        let store = Arc::new(MemoryStore::new());
        store.add_scope_role_binding("pull", "Developer");
        let authorizer = CachedScopeAuthorizer::new(Arc::clone(&store));
        assert_eq!(
            authorizer.authorize("Developer", &scopes(&["pull"])).await,
            Some(scopes(&["pull"]))
        );

        // Loaded bindings are served from the cache even when the store is down.
        store.fail_operation("scope_role_bindings");
        assert_eq!(
            authorizer.authorize("Developer", &scopes(&["pull"])).await,
            Some(scopes(&["pull"]))
        );
    }

    #[tokio::test]
    async fn cached_authorizer_denies_when_bindings_cannot_load() {
        let store = Arc::new(MemoryStore::new());
        store.add_scope_role_binding("pull", "Developer");
        store.fail_operation("scope_role_bindings");
        let authorizer = CachedScopeAuthorizer::new(Arc::clone(&store));

        assert_eq!(
            authorizer.authorize("Developer", &scopes(&["pull"])).await,
            Some(Vec::new())
        );
    }
}
