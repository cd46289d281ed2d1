use crate::{api, auth::AuthConfig};
use anyhow::Result;
use tracing::debug;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub max_connections: u32,
    pub max_failed_login_attempts: i32,
    pub session_expiry_seconds: i64,
    pub session_reuse_guard_seconds: i64,
    pub store_timeout_seconds: u64,
    pub scope_authorization: bool,
}

impl Args {
    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig::new()
            .with_max_failed_login_attempts(self.max_failed_login_attempts)
            .with_session_expiry_seconds(self.session_expiry_seconds)
            .with_session_reuse_guard_seconds(self.session_reuse_guard_seconds)
            .with_store_timeout_seconds(self.store_timeout_seconds)
            .with_scope_authorization(self.scope_authorization)
    }
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth_config = args.auth_config();
    debug!("Auth config: {:?}", auth_config);

    api::new(args.port, args.dsn, args.max_connections, auth_config).await
}
