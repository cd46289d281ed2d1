use super::*;
use crate::store::{AuthSession, LockReason, MemoryStore, UserAccount};
use argon2::Params;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

const PASSWORD: &str = "correct horse battery";
const SALT: &str = "account-salt";
const USER_AGENT: &str = "docker/24.0.7";
const CLIENT_IP: &str = "203.0.113.9";

fn verifier() -> Argon2Verifier {
    Argon2Verifier::with_params(Params::new(64, 1, 1, None).expect("argon2 params"))
}

fn seed(store: &MemoryStore, username: &str) -> UserAccount {
    let hash = verifier().hash(PASSWORD, SALT).expect("hash");
    store.add_user(username, &hash, SALT, "Developer")
}

fn service(store: &Arc<MemoryStore>, config: AuthConfig) -> AuthService<MemoryStore> {
    AuthService::new(Arc::clone(store), config).with_verifier(Arc::new(verifier()))
}

fn request(username: &str, password: &str, scopes: &[&str]) -> LoginRequest {
    LoginRequest {
        username: username.to_string(),
        password: password.to_string(),
        scopes: scopes.iter().map(ToString::to_string).collect(),
    }
}

async fn login(service: &AuthService<MemoryStore>, request: &LoginRequest) -> LoginOutcome {
    service
        .authenticate_user(request, USER_AGENT, CLIENT_IP)
        .await
}

#[tokio::test]
async fn unknown_user_is_forbidden_without_writes() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("ghost", PASSWORD, &[])).await;

    assert!(!outcome.result.success);
    assert_eq!(outcome.result.status, LoginStatus::Forbidden);
    assert_eq!(outcome.result.error_message, NO_ACCOUNT_MESSAGE);
    assert!(outcome.account.is_none());
    assert_eq!(store.write_count(), 0);
    assert_eq!(service.transactions().open_transactions(), 0);
}

#[tokio::test]
async fn wrong_password_below_threshold_counts_attempt() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.set_failed_attempts("alice", 2);
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", "wrong", &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::Forbidden);
    assert_eq!(outcome.result.error_message, INVALID_CREDENTIALS_MESSAGE);
    let account = store.user("alice").expect("account");
    assert_eq!(account.failed_attempts, 3);
    assert!(!account.locked);
    assert!(store.sessions().is_empty());
}

#[tokio::test]
async fn failure_at_threshold_does_not_lock() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.set_failed_attempts("alice", 4);
    let service = service(&store, AuthConfig::new().with_max_failed_login_attempts(5));

    let outcome = login(&service, &request("alice", "wrong", &[])).await;

    assert_eq!(outcome.result.error_message, INVALID_CREDENTIALS_MESSAGE);
    let account = store.user("alice").expect("account");
    assert_eq!(account.failed_attempts, 5);
    assert!(!account.locked);
}

#[tokio::test]
async fn failure_past_threshold_locks_account() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.set_failed_attempts("alice", 5);
    let service = service(&store, AuthConfig::new().with_max_failed_login_attempts(5));

    let outcome = login(&service, &request("alice", "wrong", &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::Forbidden);
    assert_eq!(outcome.result.error_message, ACCOUNT_LOCKED_MESSAGE);
    let account = store.user("alice").expect("account");
    assert!(account.locked);
    assert_eq!(account.lock_reason, Some(LockReason::FailedLoginAttempts));
    assert_eq!(account.failed_attempts, 6);

    let retry = login(&service, &request("alice", PASSWORD, &[])).await;
    assert_eq!(retry.result.error_message, ACCOUNT_LOCKED_MESSAGE);
}

#[tokio::test]
async fn locked_account_rejects_correct_password() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.set_locked("alice", Some(LockReason::AdminLocked));
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::Forbidden);
    assert_eq!(outcome.result.error_message, ACCOUNT_LOCKED_MESSAGE);
    assert_eq!(
        store.user("alice").expect("account").lock_reason,
        Some(LockReason::AdminLocked)
    );
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn successful_login_issues_session_and_resets_counter() {
    let store = Arc::new(MemoryStore::new());
    let seeded = seed(&store, "alice");
    store.set_failed_attempts("alice", 3);
    store.grant_namespace_access(seeded.id, "team", "Maintainer");
    store.grant_repository_access(seeded.id, "team", "api", "Developer");
    let service = service(&store, AuthConfig::new());

    let before = Utc::now();
    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    let result = &outcome.result;
    assert!(result.success);
    assert_eq!(result.status, LoginStatus::Ok);
    assert!(result.error_message.is_empty());
    assert_eq!(result.role, "Developer");
    assert!(result.authorized_scopes.is_empty());
    let expires_at = result.expires_at.expect("expiry");
    assert!(expires_at >= before + Duration::seconds(900));

    let account = outcome.account.as_ref().expect("account");
    assert_eq!(account.id, seeded.id);
    assert_eq!(account.failed_attempts, 0);
    assert_eq!(outcome.namespaces.len(), 1);
    assert_eq!(outcome.namespaces[0].namespace, "team");
    assert_eq!(outcome.repositories.len(), 1);
    assert_eq!(outcome.repositories[0].repository, "api");

    let stored = store.user("alice").expect("account");
    assert_eq!(stored.failed_attempts, 0);
    assert!(!stored.locked);

    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, result.session_id);
    assert_eq!(sessions[0].scope_hash, scope_hash(&[]));
    assert_eq!(sessions[0].user_agent, USER_AGENT);
    assert_eq!(sessions[0].client_ip, CLIENT_IP);
    assert_eq!(sessions[0].grant_type, PASSWORD_GRANT);
    assert_eq!(service.transactions().open_transactions(), 0);
}

#[tokio::test]
async fn live_session_is_reused() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    let service = service(&store, AuthConfig::new());

    let first = login(&service, &request("alice", PASSWORD, &[])).await;
    let second = login(&service, &request("alice", PASSWORD, &[])).await;

    assert!(second.result.success);
    assert_eq!(second.result.session_id, first.result.session_id);
    assert_eq!(second.result.expires_at, first.result.expires_at);
    assert_eq!(store.sessions().len(), 1);
}

#[tokio::test]
async fn session_close_to_expiry_is_replaced() {
    let store = Arc::new(MemoryStore::new());
    let seeded = seed(&store, "alice");
    let now = Utc::now();
    store.insert_session(AuthSession {
        session_id: "expiring".to_string(),
        user_id: seeded.id,
        scope_hash: scope_hash(&[]),
        issued_at: now - Duration::seconds(898),
        expires_at: Some(now + Duration::seconds(2)),
        user_agent: USER_AGENT.to_string(),
        client_ip: CLIENT_IP.to_string(),
        grant_type: PASSWORD_GRANT.to_string(),
    });
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    assert!(outcome.result.success);
    assert_ne!(outcome.result.session_id, "expiring");
    assert!(outcome.result.expires_at.expect("expiry") > now + Duration::seconds(800));
    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, outcome.result.session_id);
}

#[tokio::test]
async fn scope_order_does_not_affect_session_reuse() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.add_scope_role_binding("pull", "Developer");
    store.add_scope_role_binding("push", "Developer");
    let service = service(&store, AuthConfig::new().with_scope_authorization(true));

    let first = login(&service, &request("alice", PASSWORD, &["push", "pull"])).await;
    let second = login(&service, &request("alice", PASSWORD, &["pull", "push"])).await;

    assert!(first.result.success);
    assert_eq!(first.result.authorized_scopes, vec!["pull", "push"]);
    assert_eq!(second.result.session_id, first.result.session_id);

    let sessions = store.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0].scope_hash,
        scope_hash(&["pull".to_string(), "push".to_string()])
    );
    assert_eq!(
        store.session_scopes(&first.result.session_id),
        vec!["pull", "push"]
    );
}

#[tokio::test]
async fn unauthorized_scopes_are_forbidden() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.add_scope_role_binding("delete", "Admin");
    let service = service(&store, AuthConfig::new().with_scope_authorization(true));

    let outcome = login(&service, &request("alice", PASSWORD, &["delete"])).await;

    assert_eq!(outcome.result.status, LoginStatus::Forbidden);
    assert_eq!(outcome.result.error_message, NOT_AUTHORIZED_MESSAGE);
    assert!(store.sessions().is_empty());
}

#[tokio::test]
async fn partially_authorized_scopes_keep_granted_subset() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.add_scope_role_binding("pull", "Developer");
    store.add_scope_role_binding("delete", "Admin");
    let service = service(&store, AuthConfig::new().with_scope_authorization(true));

    let outcome = login(&service, &request("alice", PASSWORD, &["delete", "pull"])).await;

    assert!(outcome.result.success);
    assert_eq!(outcome.result.authorized_scopes, vec!["pull"]);
}

#[tokio::test]
async fn dormant_scopes_ignore_requested_scopes() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", PASSWORD, &["pull"])).await;

    assert!(outcome.result.success);
    assert!(outcome.result.authorized_scopes.is_empty());
    assert_eq!(store.sessions()[0].scope_hash, scope_hash(&[]));
}

#[tokio::test]
async fn store_failure_rolls_back_and_reports_internal_error() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.set_failed_attempts("alice", 2);
    store.fail_operation("persist_auth_session");
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    assert!(!outcome.result.success);
    assert_eq!(outcome.result.status, LoginStatus::InternalError);
    assert_eq!(outcome.result.error_message, LOGIN_ERROR_MESSAGE);
    assert!(outcome.account.is_none());
    // The unlock ran inside the rolled back transaction.
    assert_eq!(store.user("alice").expect("account").failed_attempts, 2);
    assert!(store.sessions().is_empty());
    assert_eq!(service.transactions().open_transactions(), 0);
}

#[tokio::test]
async fn failed_attempt_write_error_is_internal() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.fail_operation("record_failed_attempt");
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", "wrong", &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::InternalError);
    assert_eq!(store.user("alice").expect("account").failed_attempts, 0);
}

#[tokio::test]
async fn begin_failure_is_internal_error() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.fail_operation("BEGIN");
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::InternalError);
    assert_eq!(service.transactions().open_transactions(), 0);
}

#[tokio::test]
async fn commit_failure_is_internal_error() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.fail_operation("COMMIT");
    let service = service(&store, AuthConfig::new());

    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::InternalError);
    assert!(store.sessions().is_empty());
    assert_eq!(service.transactions().open_transactions(), 0);
}

#[tokio::test]
async fn duplicate_attempt_under_open_key_is_internal_error() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    let service = service(&store, AuthConfig::new());
    let key = transaction_key("alice", USER_AGENT);
    service.transactions().begin(&key).await.expect("begin");

    let outcome = login(&service, &request("alice", PASSWORD, &[])).await;

    assert_eq!(outcome.result.status, LoginStatus::InternalError);
    // The in-flight transaction is left to its owner.
    assert!(service.transactions().transaction(&key).await.is_some());
    service.transactions().rollback(&key).await.expect("rollback");

    let retry = login(&service, &request("alice", PASSWORD, &[])).await;
    assert!(retry.result.success);
}

#[tokio::test]
async fn different_user_agents_do_not_collide() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    let service = service(&store, AuthConfig::new());
    let key = transaction_key("alice", USER_AGENT);
    service.transactions().begin(&key).await.expect("begin");

    let outcome = service
        .authenticate_user(&request("alice", PASSWORD, &[]), "podman/4.9", CLIENT_IP)
        .await;

    assert!(outcome.result.success);
    service.transactions().rollback(&key).await.expect("rollback");
}

struct StallingScopes;

#[async_trait::async_trait]
impl ScopeAuthorizer for StallingScopes {
    async fn authorize(&self, _role: &str, _requested: &[String]) -> Option<Vec<String>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stalled_store_call_times_out_and_rolls_back() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    store.set_failed_attempts("alice", 1);
    let service = service(&store, AuthConfig::new().with_store_timeout_seconds(1))
        .with_scope_authorizer(Arc::new(StallingScopes));

    let outcome = login(&service, &request("alice", PASSWORD, &["pull"])).await;

    assert_eq!(outcome.result.status, LoginStatus::InternalError);
    assert_eq!(store.user("alice").expect("account").failed_attempts, 1);
    assert_eq!(service.transactions().open_transactions(), 0);
}

struct SlowVerifier(Argon2Verifier);

impl CredentialVerifier for SlowVerifier {
    fn verify(&self, password: &str, salt: &str, hash: &str) -> bool {
        std::thread::sleep(StdDuration::from_millis(300));
        self.0.verify(password, salt, hash)
    }
}

#[tokio::test]
async fn abandoned_login_releases_its_key() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    let service = AuthService::new(Arc::clone(&store), AuthConfig::new())
        .with_verifier(Arc::new(SlowVerifier(verifier())));
    let attempt = request("alice", PASSWORD, &[]);

    let abandoned = tokio::time::timeout(
        StdDuration::from_millis(50),
        service.authenticate_user(&attempt, USER_AGENT, CLIENT_IP),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert_eq!(service.transactions().open_transactions(), 0);

    let outcome = service
        .authenticate_user(&attempt, USER_AGENT, CLIENT_IP)
        .await;
    assert!(outcome.result.success);
}

#[tokio::test]
async fn duplicate_login_is_rejected_while_first_is_in_flight() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "alice");
    let service = Arc::new(
        AuthService::new(Arc::clone(&store), AuthConfig::new())
            .with_verifier(Arc::new(SlowVerifier(verifier()))),
    );
    let attempt = request("alice", PASSWORD, &[]);

    let first = {
        let service = Arc::clone(&service);
        let attempt = attempt.clone();
        tokio::spawn(async move {
            service
                .authenticate_user(&attempt, USER_AGENT, CLIENT_IP)
                .await
        })
    };
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let key = transaction_key("alice", USER_AGENT);
    let begin = tokio::time::timeout(
        StdDuration::from_millis(100),
        service.transactions().begin(&key),
    )
    .await
    .expect("begin must not wait for the running attempt");
    assert!(matches!(begin, Err(crate::tx::TxError::AlreadyOpen { .. })));

    let duplicate = tokio::time::timeout(
        StdDuration::from_millis(100),
        service.authenticate_user(&attempt, USER_AGENT, CLIENT_IP),
    )
    .await
    .expect("duplicate login must not wait for the running attempt");
    assert_eq!(duplicate.result.status, LoginStatus::InternalError);

    let outcome = first.await.expect("task");
    assert!(outcome.result.success);
    assert_eq!(service.transactions().open_transactions(), 0);
}

#[test]
fn transaction_key_is_stable_per_user_and_agent() {
    let key = transaction_key("alice", USER_AGENT);
    assert!(key.starts_with("login:"));
    assert_eq!(key, transaction_key("alice", USER_AGENT));
    assert_ne!(key, transaction_key("alice", "podman/4.9"));
    assert_ne!(key, transaction_key("bob", USER_AGENT));
    // The separator keeps username/agent boundaries unambiguous.
    assert_ne!(transaction_key("ab", "c"), transaction_key("a", "bc"));
}

#[test]
fn login_request_debug_hides_password() {
    let rendered = format!("{:?}", request("alice", PASSWORD, &[]));
    assert!(rendered.contains("alice"));
    assert!(!rendered.contains(PASSWORD));
}
