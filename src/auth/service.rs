use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::password::PasswordHasher;
use crate::auth::token::{Audience, TokenManager};
use crate::config::Settings;
use crate::db::models::{ClientMeta, NewPrincipal, Session, SessionReplacement};
use crate::db::store::{PrincipalStore, SessionStore};
use crate::error::{AppError, AuthError, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SignUpInput {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    /// Sessions a principal may hold before the next sign-in revokes them all.
    pub max_sessions: usize,
    /// Upper bound on every store call.
    pub store_timeout: std::time::Duration,
}

impl SessionPolicy {
    pub fn from_settings(settings: &Settings, audience: Audience) -> Self {
        let max_sessions = match audience {
            Audience::User => settings.auth.max_user_sessions,
            Audience::Admin => settings.auth.max_admin_sessions,
        };
        Self {
            access_ttl: settings.auth.access_token_ttl(),
            refresh_ttl: settings.auth.refresh_token_ttl(),
            max_sessions,
            store_timeout: settings.server.request_timeout(),
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            access_ttl: Duration::minutes(30),
            refresh_ttl: Duration::hours(30),
            max_sessions: 3,
            store_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// Session lifecycle for one audience: sign-in, refresh rotation, sign-out.
///
/// User and admin instances share the algorithm but not their stores, and the
/// access tokens they mint carry their own audience claim.
pub struct AuthService {
    audience: Audience,
    principals: Arc<dyn PrincipalStore>,
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<TokenManager>,
    hasher: Arc<dyn PasswordHasher>,
    policy: SessionPolicy,
}

impl AuthService {
    pub fn new(
        audience: Audience,
        principals: Arc<dyn PrincipalStore>,
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<TokenManager>,
        hasher: Arc<dyn PasswordHasher>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            audience,
            principals,
            sessions,
            tokens,
            hasher,
            policy,
        }
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Store work that misses the deadline is dropped; an open transaction
    /// rolls back with it.
    async fn with_deadline<T, F>(&self, op: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        match tokio::time::timeout(self.policy.store_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("{} session store call exceeded {:?}", self.audience, self.policy.store_timeout);
                Err(DatabaseError::Timeout.into())
            }
        }
    }

    // Argon2id takes tens of milliseconds; keep it off the request workers.
    async fn digest(&self, plaintext: &str) -> Result<String, AppError> {
        let hasher = self.hasher.clone();
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plaintext))
            .await
            .map_err(|e| AppError::InternalError(format!("password hashing task failed: {}", e)))?
    }

    pub async fn sign_up(&self, input: &SignUpInput) -> Result<String, AppError> {
        let email = input.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::ValidationError("a valid email is required".into()));
        }
        if input.password.is_empty() {
            return Err(AppError::ValidationError("password must not be empty".into()));
        }

        let principal = NewPrincipal {
            email: email.to_string(),
            password_hash: self.digest(&input.password).await?,
            first_name: input.first_name.clone(),
            last_name: input.last_name.clone(),
        };
        let id = self.with_deadline(self.principals.create_principal(&principal)).await?;

        info!("Created {} principal {}", self.audience, id);
        Ok(id)
    }

    pub async fn sign_in(&self, credentials: &Credentials, meta: &ClientMeta) -> Result<Tokens, AppError> {
        let hashed = self.digest(&credentials.password).await?;
        let principal_id = self
            .with_deadline(
                self.principals
                    .find_principal_by_credential(credentials.email.trim(), &hashed),
            )
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        self.create_session(&principal_id, meta).await
    }

    /// Persists a new session, then mints the access token for it.
    pub async fn create_session(&self, principal_id: &str, meta: &ClientMeta) -> Result<Tokens, AppError> {
        let refresh_token = self.tokens.issue_refresh_token()?;
        let session = Session::new(principal_id.to_string(), refresh_token, self.policy.refresh_ttl, meta);

        self.with_deadline(self.sessions.insert_session(&session, self.policy.max_sessions))
            .await?;

        let access_token = self
            .tokens
            .issue_access_token(principal_id, self.audience, self.policy.access_ttl)?;

        info!("Opened {} session {} for {}", self.audience, session.id, principal_id);
        Ok(Tokens {
            access_token,
            refresh_token: session.refresh_token,
        })
    }

    /// Exchanges a refresh token for a new pair. Each refresh token works at
    /// most once.
    pub async fn refresh_session(&self, refresh_token: &str, meta: &ClientMeta) -> Result<Tokens, AppError> {
        if refresh_token.is_empty() {
            return Err(AuthError::SessionNotFound.into());
        }

        let replacement =
            SessionReplacement::new(self.tokens.issue_refresh_token()?, self.policy.refresh_ttl, meta);
        let session = self
            .with_deadline(self.sessions.rotate_session(refresh_token, &replacement, Utc::now()))
            .await?
            .ok_or_else(|| {
                warn!("{} refresh rejected: token unknown, expired or already rotated", self.audience);
                AuthError::SessionNotFound
            })?;

        let access_token = self
            .tokens
            .issue_access_token(&session.principal_id, self.audience, self.policy.access_ttl)?;

        info!("Rotated {} session for {}", self.audience, session.principal_id);
        Ok(Tokens {
            access_token,
            refresh_token: session.refresh_token,
        })
    }

    /// Revokes every session of the principal. Signing out twice is not an error.
    pub async fn sign_out(&self, principal_id: &str) -> Result<u64, AppError> {
        let revoked = self
            .with_deadline(self.sessions.delete_sessions_by_principal(principal_id))
            .await?;
        info!("Signed out {} {} ({} sessions revoked)", self.audience, principal_id, revoked);
        Ok(revoked)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<String, AuthError> {
        self.tokens.verify_access_token(token, self.audience)
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64, AppError> {
        self.with_deadline(self.sessions.delete_expired_sessions(Utc::now()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::LegacySha1Hasher;
    use crate::db::memory::MemoryStore;
    use crate::db::store::{MockPrincipalStore, MockSessionStore};
    use async_trait::async_trait;
    use chrono::DateTime;

    fn tokens() -> Arc<TokenManager> {
        Arc::new(TokenManager::new("unit-test-key").unwrap())
    }

    fn hasher() -> Arc<dyn PasswordHasher> {
        Arc::new(LegacySha1Hasher::new("unit-test-salt").unwrap())
    }

    fn service_with(principals: Arc<dyn PrincipalStore>, sessions: Arc<dyn SessionStore>) -> AuthService {
        AuthService::new(Audience::User, principals, sessions, tokens(), hasher(), SessionPolicy::default())
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "ann@example.com".into(),
            password: "hunter2".into(),
        }
    }

    #[tokio::test]
    async fn test_unknown_credentials() {
        let mut principals = MockPrincipalStore::new();
        principals
            .expect_find_principal_by_credential()
            .returning(|_, _| Ok(None));
        let mut sessions = MockSessionStore::new();
        sessions.expect_insert_session().never();

        let service = service_with(Arc::new(principals), Arc::new(sessions));
        let result = service.sign_in(&credentials(), &ClientMeta::default()).await;

        assert!(matches!(result, Err(AppError::AuthError(AuthError::InvalidCredentials))));
    }

    #[tokio::test]
    async fn test_sign_in_looks_up_hashed_secret() {
        let expected = LegacySha1Hasher::new("unit-test-salt").unwrap().hash("hunter2").unwrap();
        let mut principals = MockPrincipalStore::new();
        principals
            .expect_find_principal_by_credential()
            .withf(move |email, secret| email == "ann@example.com" && secret == expected)
            .returning(|_, _| Ok(Some("p-1".to_string())));
        let mut sessions = MockSessionStore::new();
        sessions
            .expect_insert_session()
            .withf(|session, cap| session.principal_id == "p-1" && *cap == 3)
            .returning(|_, _| Ok(()));

        let service = service_with(Arc::new(principals), Arc::new(sessions));
        let issued = service.sign_in(&credentials(), &ClientMeta::default()).await.unwrap();

        assert_eq!(service.verify_access_token(&issued.access_token).unwrap(), "p-1");
    }

    #[tokio::test]
    async fn test_persistence_failure_issues_nothing() {
        let mut principals = MockPrincipalStore::new();
        principals
            .expect_find_principal_by_credential()
            .returning(|_, _| Ok(Some("p-1".to_string())));
        let mut sessions = MockSessionStore::new();
        sessions
            .expect_insert_session()
            .returning(|_, _| Err(DatabaseError::ConnectionError("connection reset".into())));

        let service = service_with(Arc::new(principals), Arc::new(sessions));
        let result = service.sign_in(&credentials(), &ClientMeta::default()).await;

        assert!(matches!(
            result,
            Err(AppError::DatabaseError(DatabaseError::ConnectionError(_)))
        ));
    }

    #[tokio::test]
    async fn test_refresh_of_unknown_token() {
        let mut sessions = MockSessionStore::new();
        sessions.expect_rotate_session().returning(|_, _, _| Ok(None));

        let service = service_with(Arc::new(MockPrincipalStore::new()), Arc::new(sessions));
        let result = service.refresh_session("nope", &ClientMeta::default()).await;

        assert!(matches!(result, Err(AppError::AuthError(AuthError::SessionNotFound))));
    }

    #[tokio::test]
    async fn test_empty_refresh_token_skips_store() {
        let mut sessions = MockSessionStore::new();
        sessions.expect_rotate_session().never();

        let service = service_with(Arc::new(MockPrincipalStore::new()), Arc::new(sessions));
        let result = service.refresh_session("", &ClientMeta::default()).await;

        assert!(matches!(result, Err(AppError::AuthError(AuthError::SessionNotFound))));
    }

    #[tokio::test]
    async fn test_sign_up_validation() {
        let mut principals = MockPrincipalStore::new();
        principals.expect_create_principal().never();
        let service = service_with(Arc::new(principals), Arc::new(MockSessionStore::new()));

        let no_email = SignUpInput {
            email: "  ".into(),
            password: "secret".into(),
            first_name: None,
            last_name: None,
        };
        assert!(matches!(service.sign_up(&no_email).await, Err(AppError::ValidationError(_))));

        let no_password = SignUpInput {
            email: "ann@example.com".into(),
            password: String::new(),
            first_name: None,
            last_name: None,
        };
        assert!(matches!(service.sign_up(&no_password).await, Err(AppError::ValidationError(_))));
    }

    /// Delegates to a memory store but stalls rotations.
    struct StalledRotation(MemoryStore);

    #[async_trait]
    impl SessionStore for StalledRotation {
        async fn insert_session(&self, session: &Session, cap: usize) -> Result<(), DatabaseError> {
            self.0.insert_session(session, cap).await
        }

        async fn find_session_by_refresh_token(&self, token: &str) -> Result<Option<Session>, DatabaseError> {
            self.0.find_session_by_refresh_token(token).await
        }

        async fn count_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError> {
            self.0.count_sessions_by_principal(principal_id).await
        }

        async fn delete_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError> {
            self.0.delete_sessions_by_principal(principal_id).await
        }

        async fn rotate_session(
            &self,
            refresh_token: &str,
            replacement: &SessionReplacement,
            now: DateTime<Utc>,
        ) -> Result<Option<Session>, DatabaseError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            self.0.rotate_session(refresh_token, replacement, now).await
        }

        async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
            self.0.delete_expired_sessions(now).await
        }
    }

    #[tokio::test]
    async fn test_store_deadline_leaves_session_intact() {
        let store = Arc::new(StalledRotation(MemoryStore::new()));
        let policy = SessionPolicy {
            store_timeout: std::time::Duration::from_millis(50),
            ..SessionPolicy::default()
        };
        let service = AuthService::new(
            Audience::User,
            Arc::new(MemoryStore::new()),
            store.clone(),
            tokens(),
            hasher(),
            policy,
        );

        let issued = service.create_session("p-1", &ClientMeta::default()).await.unwrap();
        let result = service.refresh_session(&issued.refresh_token, &ClientMeta::default()).await;

        assert!(matches!(result, Err(AppError::DatabaseError(DatabaseError::Timeout))));
        assert!(store
            .find_session_by_refresh_token(&issued.refresh_token)
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.count_sessions_by_principal("p-1").await.unwrap(), 1);
    }
}
