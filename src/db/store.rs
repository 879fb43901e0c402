use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{NewPrincipal, Session, SessionReplacement};
use crate::error::DatabaseError;

// A store instance serves exactly one audience.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn find_principal_by_credential(
        &self,
        identity: &str,
        hashed_secret: &str,
    ) -> Result<Option<String>, DatabaseError>;

    /// Fails with [`DatabaseError::Duplicate`] when the identity is taken.
    async fn create_principal(&self, principal: &NewPrincipal) -> Result<String, DatabaseError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts `session`. If its principal already holds `cap` or more
    /// sessions, all of them are deleted first, in the same atomic step.
    async fn insert_session(&self, session: &Session, cap: usize) -> Result<(), DatabaseError>;

    async fn find_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<Session>, DatabaseError>;

    async fn count_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError>;

    async fn delete_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError>;

    /// Consumes the unexpired session holding `refresh_token`, deletes every
    /// other session of its principal and inserts `replacement`, atomically.
    ///
    /// Returns `None` when no unexpired session holds the token. Of several
    /// concurrent calls with the same token at most one returns `Some`.
    async fn rotate_session(
        &self,
        refresh_token: &str,
        replacement: &SessionReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, DatabaseError>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;
}
