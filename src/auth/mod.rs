//! Authentication and request admission.
//!
//! Token issuance, credential digests, the per-audience session lifecycle,
//! the per-client rate limiter and the middleware that chains them.

pub mod handlers;
pub mod middleware;
pub mod password;
mod rate_limit;
mod service;
mod token;

pub use middleware::AuthenticatedPrincipal;
pub use password::{Argon2idHasher, LegacySha1Hasher, PasswordHasher, PasswordScheme};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use service::{AuthService, Credentials, SessionPolicy, SignUpInput, Tokens};
pub use token::{Audience, Claims, TokenManager};
