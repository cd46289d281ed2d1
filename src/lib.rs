//! # registry-auth
//!
//! Password login for the image registry management API.
//!
//! ## Keyed transactions
//!
//! [`tx::TransactionManager`] maps a caller-chosen key to at most one open
//! database transaction. Opening a second transaction under a key that is still
//! open is reported as an error rather than queued; committing or rolling back
//! a key that has no transaction is reported as well. Unrelated keys never wait
//! on each other.
//!
//! ## Login
//!
//! [`auth::AuthService`] runs each attempt inside one keyed transaction derived
//! from the username and user agent:
//!
//! - unknown or locked accounts are rejected;
//! - a wrong password increments the failed attempt counter and locks the
//!   account once the configured threshold is passed;
//! - a correct password clears the lock state, resolves the role and the
//!   authorized scopes, then reuses the live session for that scope set or
//!   issues a new one.
//!
//! Store failures roll the attempt back and surface as a generic internal error.

pub mod api;
pub mod auth;
pub mod cli;
pub mod store;
pub mod tx;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
