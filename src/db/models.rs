use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Request metadata recorded alongside a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
}

/// Credential row to insert on sign-up. The secret is already hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrincipal {
    pub email: String,
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: Uuid,
    pub principal_id: String,
    pub refresh_token: String,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(principal_id: String, refresh_token: String, ttl: Duration, meta: &ClientMeta) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            principal_id,
            refresh_token,
            user_agent: meta.user_agent.clone(),
            client_ip: meta.client_ip.clone(),
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// The row that replaces a consumed session during refresh rotation.
///
/// The principal is taken from the consumed session; missing client metadata
/// is carried over from it as well.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReplacement {
    pub id: Uuid,
    pub refresh_token: String,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionReplacement {
    pub fn new(refresh_token: String, ttl: Duration, meta: &ClientMeta) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            refresh_token,
            user_agent: meta.user_agent.clone(),
            client_ip: meta.client_ip.clone(),
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn into_session(self, consumed: &Session) -> Session {
        Session {
            id: self.id,
            principal_id: consumed.principal_id.clone(),
            refresh_token: self.refresh_token,
            user_agent: self.user_agent.or_else(|| consumed.user_agent.clone()),
            client_ip: self.client_ip.or_else(|| consumed.client_ip.clone()),
            expires_at: self.expires_at,
            created_at: self.created_at,
        }
    }
}
