use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::models::{NewPrincipal, Session, SessionReplacement};
use crate::db::store::{PrincipalStore, SessionStore};
use crate::error::DatabaseError;

#[derive(Debug)]
struct PrincipalRecord {
    id: String,
    password_hash: String,
}

#[derive(Debug, Default)]
struct Inner {
    // keyed by email
    principals: HashMap<String, PrincipalRecord>,
    // keyed by refresh token
    sessions: HashMap<String, Session>,
}

/// Every operation runs under one mutex, which makes each of them atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn find_principal_by_credential(
        &self,
        identity: &str,
        hashed_secret: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .principals
            .get(identity)
            .filter(|record| record.password_hash == hashed_secret)
            .map(|record| record.id.clone()))
    }

    async fn create_principal(&self, principal: &NewPrincipal) -> Result<String, DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.principals.contains_key(&principal.email) {
            return Err(DatabaseError::Duplicate);
        }

        let id = Uuid::new_v4().to_string();
        inner.principals.insert(
            principal.email.clone(),
            PrincipalRecord {
                id: id.clone(),
                password_hash: principal.password_hash.clone(),
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session, cap: usize) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(&session.refresh_token) {
            return Err(DatabaseError::Duplicate);
        }

        let held = inner
            .sessions
            .values()
            .filter(|s| s.principal_id == session.principal_id)
            .count();
        if held >= cap {
            inner.sessions.retain(|_, s| s.principal_id != session.principal_id);
        }

        inner.sessions.insert(session.refresh_token.clone(), session.clone());
        Ok(())
    }

    async fn find_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        Ok(self.inner.lock().await.sessions.get(refresh_token).cloned())
    }

    async fn count_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.principal_id == principal_id)
            .count() as u64)
    }

    async fn delete_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.principal_id != principal_id);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn rotate_session(
        &self,
        refresh_token: &str,
        replacement: &SessionReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, DatabaseError> {
        let mut inner = self.inner.lock().await;

        let live = inner
            .sessions
            .get(refresh_token)
            .is_some_and(|s| !s.is_expired_at(now));
        if !live {
            return Ok(None);
        }
        if inner.sessions.contains_key(&replacement.refresh_token) {
            return Err(DatabaseError::Duplicate);
        }

        let Some(consumed) = inner.sessions.remove(refresh_token) else {
            return Ok(None);
        };
        inner.sessions.retain(|_, s| s.principal_id != consumed.principal_id);

        let session = replacement.clone().into_session(&consumed);
        inner.sessions.insert(session.refresh_token.clone(), session.clone());
        Ok(Some(session))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - inner.sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ClientMeta;
    use chrono::Duration;

    fn session(principal: &str, token: &str, ttl: Duration) -> Session {
        Session::new(principal.into(), token.into(), ttl, &ClientMeta::default())
    }

    #[tokio::test]
    async fn test_credentials() {
        let store = MemoryStore::new();
        let principal = NewPrincipal {
            email: "ann@example.com".into(),
            password_hash: "digest".into(),
            first_name: Some("Ann".into()),
            last_name: None,
        };

        let id = store.create_principal(&principal).await.unwrap();
        assert!(matches!(
            store.create_principal(&principal).await,
            Err(DatabaseError::Duplicate)
        ));

        assert_eq!(
            store.find_principal_by_credential("ann@example.com", "digest").await.unwrap(),
            Some(id)
        );
        assert_eq!(
            store.find_principal_by_credential("ann@example.com", "other").await.unwrap(),
            None
        );
        assert_eq!(
            store.find_principal_by_credential("bob@example.com", "digest").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_insert_revokes_all_at_cap() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.insert_session(&session("p1", &format!("t{i}"), Duration::hours(1)), 3).await.unwrap();
        }
        store.insert_session(&session("p2", "other", Duration::hours(1)), 3).await.unwrap();
        assert_eq!(store.count_sessions_by_principal("p1").await.unwrap(), 3);

        store.insert_session(&session("p1", "t3", Duration::hours(1)), 3).await.unwrap();
        assert_eq!(store.count_sessions_by_principal("p1").await.unwrap(), 1);
        assert_eq!(store.count_sessions_by_principal("p2").await.unwrap(), 1);
        assert!(store.find_session_by_refresh_token("t3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rotation_consumes_once() {
        let store = MemoryStore::new();
        store.insert_session(&session("p1", "old", Duration::hours(1)), 3).await.unwrap();
        store.insert_session(&session("p1", "sibling", Duration::hours(1)), 3).await.unwrap();

        let replacement = SessionReplacement::new("new".into(), Duration::hours(1), &ClientMeta::default());
        let rotated = store.rotate_session("old", &replacement, Utc::now()).await.unwrap().unwrap();
        assert_eq!(rotated.principal_id, "p1");
        assert_eq!(store.count_sessions_by_principal("p1").await.unwrap(), 1);

        let again = SessionReplacement::new("newer".into(), Duration::hours(1), &ClientMeta::default());
        assert!(store.rotate_session("old", &again, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotation_rejects_expired() {
        let store = MemoryStore::new();
        store.insert_session(&session("p1", "stale", Duration::seconds(-1)), 3).await.unwrap();

        let replacement = SessionReplacement::new("new".into(), Duration::hours(1), &ClientMeta::default());
        assert!(store.rotate_session("stale", &replacement, Utc::now()).await.unwrap().is_none());
        assert!(store.find_session_by_refresh_token("new").await.unwrap().is_none());

        assert_eq!(store.delete_expired_sessions(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.session_count().await, 0);
    }
}
