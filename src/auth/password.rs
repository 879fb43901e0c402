use argon2::Argon2;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::error::AppError;

/// Deterministic credential digest. Principals are looked up by
/// `(email, hash(password))`, so equal inputs must give equal digests.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plaintext: &str) -> Result<String, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordScheme {
    /// Matches digests already stored by the existing deployment.
    LegacySha1,
    Argon2id,
}

/// `hex(salt || sha1(password))`. The salt is prepended to the digest, not
/// mixed into it, so this is only as strong as unsalted SHA-1. It is kept for
/// stored-credential compatibility.
#[derive(Clone)]
pub struct LegacySha1Hasher {
    salt: String,
}

impl LegacySha1Hasher {
    pub fn new(salt: impl Into<String>) -> Result<Self, AppError> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(AppError::ConfigError("empty password hasher salt".into()));
        }
        Ok(Self { salt })
    }
}

impl PasswordHasher for LegacySha1Hasher {
    fn hash(&self, plaintext: &str) -> Result<String, AppError> {
        let digest = Sha1::digest(plaintext.as_bytes());
        let mut out = hex(self.salt.as_bytes());
        out.push_str(&hex(&digest));
        Ok(out)
    }
}

/// Argon2id keyed by the configured salt. Still deterministic, but slow and
/// memory-hard. Switching a deployment to it invalidates legacy digests.
#[derive(Clone)]
pub struct Argon2idHasher {
    salt: String,
    argon2: Argon2<'static>,
}

impl Argon2idHasher {
    const OUTPUT_LEN: usize = 32;

    pub fn new(salt: impl Into<String>) -> Result<Self, AppError> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(AppError::ConfigError("empty password hasher salt".into()));
        }
        if salt.len() < argon2::MIN_SALT_LEN {
            return Err(AppError::ConfigError(format!(
                "argon2id salt must be at least {} bytes",
                argon2::MIN_SALT_LEN
            )));
        }
        Ok(Self {
            salt,
            argon2: Argon2::default(),
        })
    }
}

impl PasswordHasher for Argon2idHasher {
    fn hash(&self, plaintext: &str) -> Result<String, AppError> {
        let mut out = [0u8; Self::OUTPUT_LEN];
        self.argon2
            .hash_password_into(plaintext.as_bytes(), self.salt.as_bytes(), &mut out)
            .map_err(|e| AppError::InternalError(format!("argon2id hashing failed: {}", e)))?;
        Ok(hex(&out))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Builds the hasher selected by `auth.password_scheme`.
pub fn from_config(config: &AuthConfig) -> Result<Arc<dyn PasswordHasher>, AppError> {
    let hasher: Arc<dyn PasswordHasher> = match config.password_scheme {
        PasswordScheme::LegacySha1 => Arc::new(LegacySha1Hasher::new(config.password_salt.clone())?),
        PasswordScheme::Argon2id => Arc::new(Argon2idHasher::new(config.password_salt.clone())?),
    };
    Ok(hasher)
}
