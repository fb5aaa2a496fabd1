//! Argon2id password hashing.
//!
//! Hashes are stored as PHC strings so the parameters travel with the hash
//! and can be raised later without invalidating existing accounts.

use rand::rngs::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::CredentialError;

/// Memory cost in KiB (19 MiB).
pub const M_COST: u32 = 19 * 1024;
pub const T_COST: u32 = 2;
pub const P_COST: u32 = 1;

fn hasher() -> Result<Argon2<'static>, CredentialError> {
    let params = Params::new(M_COST, T_COST, P_COST, None)
        .map_err(|e| CredentialError::Hashing(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash `plain` with a fresh random salt.
pub fn hash(plain: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| CredentialError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

/// Constant-time check of `candidate` against a stored PHC hash.
///
/// An unparseable stored hash never verifies.
pub fn verify(stored: &str, candidate: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    match hasher() {
        Ok(argon) => argon
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
