use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_MAX_FAILED_LOGIN_ATTEMPTS: &str = "max-failed-login-attempts";
pub const ARG_SESSION_EXPIRY_SECONDS: &str = "session-expiry-seconds";
pub const ARG_SESSION_REUSE_GUARD_SECONDS: &str = "session-reuse-guard-seconds";
pub const ARG_STORE_TIMEOUT_SECONDS: &str = "store-timeout-seconds";
pub const ARG_SCOPE_AUTHORIZATION: &str = "scope-authorization";

#[derive(Debug)]
pub struct Options {
    pub max_failed_login_attempts: i32,
    pub session_expiry_seconds: i64,
    pub session_reuse_guard_seconds: i64,
    pub store_timeout_seconds: u64,
    pub scope_authorization: bool,
}

impl Options {
    /// Read login policy options.
    ///
    /// # Errors
    /// Returns an error if a defaulted argument is missing from the matches.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        Ok(Self {
            max_failed_login_attempts: required(matches, ARG_MAX_FAILED_LOGIN_ATTEMPTS)?,
            session_expiry_seconds: required(matches, ARG_SESSION_EXPIRY_SECONDS)?,
            session_reuse_guard_seconds: required(matches, ARG_SESSION_REUSE_GUARD_SECONDS)?,
            store_timeout_seconds: required(matches, ARG_STORE_TIMEOUT_SECONDS)?,
            scope_authorization: matches.get_flag(ARG_SCOPE_AUTHORIZATION),
        })
    }
}

fn required<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> anyhow::Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_FAILED_LOGIN_ATTEMPTS)
                .long(ARG_MAX_FAILED_LOGIN_ATTEMPTS)
                .help("Failed logins tolerated before the account is locked")
                .env("REGISTRY_AUTH_MAX_FAILED_LOGIN_ATTEMPTS")
                .default_value("5")
                .value_parser(clap::value_parser!(i32).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_EXPIRY_SECONDS)
                .long(ARG_SESSION_EXPIRY_SECONDS)
                .help("Session lifetime in seconds, also used as the cookie max-age")
                .env("REGISTRY_AUTH_SESSION_EXPIRY_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_REUSE_GUARD_SECONDS)
                .long(ARG_SESSION_REUSE_GUARD_SECONDS)
                .help("Sessions expiring within this many seconds are replaced instead of reused")
                .env("REGISTRY_AUTH_SESSION_REUSE_GUARD_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(i64).range(0..)),
        )
        .arg(
            Arg::new(ARG_STORE_TIMEOUT_SECONDS)
                .long(ARG_STORE_TIMEOUT_SECONDS)
                .help("Deadline for each database call made during login")
                .env("REGISTRY_AUTH_STORE_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SCOPE_AUTHORIZATION)
                .long(ARG_SCOPE_AUTHORIZATION)
                .help("Check requested scopes against the scope role bindings")
                .env("REGISTRY_AUTH_SCOPE_AUTHORIZATION")
                .action(ArgAction::SetTrue),
        )
}
