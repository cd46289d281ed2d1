//! Maps validated CLI arguments to the action to run.

use crate::cli::actions::{server::Args, Action};
use crate::cli::commands::{auth, ARG_DSN, ARG_MAX_CONNECTIONS, ARG_PORT};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;
    let max_connections = matches
        .get_one::<u32>(ARG_MAX_CONNECTIONS)
        .copied()
        .unwrap_or(5);

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        max_connections,
        max_failed_login_attempts: auth_opts.max_failed_login_attempts,
        session_expiry_seconds: auth_opts.session_expiry_seconds,
        session_reuse_guard_seconds: auth_opts.session_reuse_guard_seconds,
        store_timeout_seconds: auth_opts.store_timeout_seconds,
        scope_authorization: auth_opts.scope_authorization,
    }))
}
