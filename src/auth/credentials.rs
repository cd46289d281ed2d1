//! Password verification against stored credentials.
//!
//! Stored hashes are Argon2 PHC strings computed over `password || salt`, where
//! the salt is the per-account value kept next to the hash.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, Salt, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

/// Checks a plaintext password against a stored salt and hash.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, password: &str, salt: &str, hash: &str) -> bool;
}

#[derive(Clone, Default)]
pub struct Argon2Verifier {
    params: Option<Params>,
}

impl Argon2Verifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit cost parameters instead of the Argon2id defaults.
    #[must_use]
    pub fn with_params(params: Params) -> Self {
        Self {
            params: Some(params),
        }
    }

    /// Produce the stored PHC hash for `password` with the account `salt`.
    ///
    /// # Errors
    /// Returns an error if the salt is shorter than 3 or longer than 48 bytes, or if
    /// hashing fails.
    pub fn hash(&self, password: &str, salt: &str) -> Result<String, argon2::password_hash::Error> {
        let encoded = SaltString::encode_b64(salt.as_bytes())?;
        // `encode_b64` accepts salts that encode below the PHC minimum length.
        let phc_salt = Salt::from_b64(encoded.as_str())?;
        self.hasher()
            .hash_password(salted(password, salt).as_bytes(), phc_salt)
            .map(|hash| hash.to_string())
    }

    fn hasher(&self) -> Argon2<'static> {
        match &self.params {
            Some(params) => Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone()),
            None => Argon2::default(),
        }
    }
}

impl CredentialVerifier for Argon2Verifier {
    fn verify(&self, password: &str, salt: &str, hash: &str) -> bool {
        PasswordHash::new(hash).is_ok_and(|parsed| {
            self.hasher()
                .verify_password(salted(password, salt).as_bytes(), &parsed)
                .is_ok()
        })
    }
}

fn salted(password: &str, salt: &str) -> String {
    let mut input = String::with_capacity(password.len() + salt.len());
    input.push_str(password);
    input.push_str(salt);
    input
}
