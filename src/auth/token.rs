use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AuthError};

/// 32 bytes = 256 bits of entropy, 43 characters once encoded.
const REFRESH_TOKEN_BYTES: usize = 32;

/// Which principal namespace a token or session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    User,
    Admin,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::User => "user",
            Audience::Admin => "admin",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // Principal ID
    pub aud: String,  // Audience
    pub exp: i64,     // Expiration time
    pub iat: i64,     // Issued at
    pub jti: String,  // Unique token id
}

// Access tokens are HS256 JWTs verified statelessly; refresh tokens are opaque
// and only mean something to the session store.
#[derive(Clone)]
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenManager {
    pub fn new(signing_key: &str) -> Result<Self, AppError> {
        if signing_key.is_empty() {
            return Err(AppError::ConfigError("empty token signing key".into()));
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_key.as_bytes()),
        })
    }

    pub fn issue_access_token(
        &self,
        principal_id: &str,
        audience: Audience,
        ttl: Duration,
    ) -> Result<String, AppError> {
        self.issue_access_token_at(principal_id, audience, ttl, Utc::now())
    }

    pub(crate) fn issue_access_token_at(
        &self,
        principal_id: &str,
        audience: Audience,
        ttl: Duration,
        issued_at: DateTime<Utc>,
    ) -> Result<String, AppError> {
        let claims = Claims {
            sub: principal_id.to_string(),
            aud: audience.as_str().to_string(),
            exp: (issued_at + ttl).timestamp(),
            iat: issued_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }

    pub fn issue_refresh_token(&self) -> Result<String, AppError> {
        let mut buffer = [0u8; REFRESH_TOKEN_BYTES];
        OsRng
            .try_fill_bytes(&mut buffer)
            .map_err(|e| AppError::RandomSourceError(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(buffer))
    }

    /// Returns the token's subject if the signature, audience and expiry hold.
    pub fn verify_access_token(&self, token: &str, audience: Audience) -> Result<String, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_audience(&[audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims.sub)
            .map_err(|e| {
                debug!("Access token rejected for audience {}: {}", audience, e);
                AuthError::InvalidToken
            })
    }
}
