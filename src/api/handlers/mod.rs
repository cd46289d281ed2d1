//! API handlers for the auth service.

pub mod health;
pub mod login;

pub use health::HealthCheck;
