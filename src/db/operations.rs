use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::auth::Audience;
use crate::db::models::{NewPrincipal, Session, SessionReplacement};
use crate::db::store::{PrincipalStore, SessionStore};
use crate::error::{AppError, DatabaseError};

const SESSION_COLUMNS: &str =
    "id, principal_id::text AS principal_id, refresh_token, user_agent, client_ip, expires_at, created_at";

struct Tables {
    principals: &'static str,
    sessions: &'static str,
}

fn tables(audience: Audience) -> Tables {
    match audience {
        Audience::User => Tables { principals: "users", sessions: "user_sessions" },
        Audience::Admin => Tables { principals: "admins", sessions: "admin_sessions" },
    }
}

pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
        .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::DatabaseError(DatabaseError::QueryError(e.to_string())))
}

/// PostgreSQL-backed principal and session store for one audience.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
    audience: Audience,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>, audience: Audience) -> Self {
        Self { pool, audience }
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>, DatabaseError> {
        Ok(self.pool.as_ref().begin().await?)
    }

    async fn insert_row(
        &self,
        session: &Session,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO {} (id, principal_id, refresh_token, user_agent, client_ip, expires_at, created_at) \
             VALUES ($1, $2::uuid, $3, $4, $5, $6, $7)",
            tables(self.audience).sessions
        );
        sqlx::query(&sql)
            .bind(session.id)
            .bind(&session.principal_id)
            .bind(&session.refresh_token)
            .bind(&session.user_agent)
            .bind(&session.client_ip)
            .bind(session.expires_at)
            .bind(session.created_at)
            .execute(&mut **transaction)
            .await?;
        Ok(())
    }

    // Every writer locks the principal row before touching its sessions, so
    // writers for one principal queue up instead of deadlocking. NO KEY UPDATE
    // leaves the foreign-key checks of session inserts unblocked.
    async fn lock_principal(
        &self,
        principal_id: &str,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "SELECT id FROM {} WHERE id = $1::uuid FOR NO KEY UPDATE",
            tables(self.audience).principals
        );
        sqlx::query(&sql)
            .bind(principal_id)
            .execute(&mut **transaction)
            .await?;
        Ok(())
    }

    async fn delete_by_principal(
        &self,
        principal_id: &str,
        transaction: &mut Transaction<'_, Postgres>,
    ) -> Result<u64, DatabaseError> {
        let sql = format!(
            "DELETE FROM {} WHERE principal_id = $1::uuid",
            tables(self.audience).sessions
        );
        let result = sqlx::query(&sql)
            .bind(principal_id)
            .execute(&mut **transaction)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PrincipalStore for PgStore {
    async fn find_principal_by_credential(
        &self,
        identity: &str,
        hashed_secret: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let sql = format!(
            "SELECT id::text FROM {} WHERE email = $1 AND password_hash = $2",
            tables(self.audience).principals
        );
        let id = sqlx::query_scalar::<_, String>(&sql)
            .bind(identity)
            .bind(hashed_secret)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(id)
    }

    async fn create_principal(&self, principal: &NewPrincipal) -> Result<String, DatabaseError> {
        let query = match self.audience {
            Audience::User => sqlx::query_scalar::<_, String>(
                "INSERT INTO users (email, password_hash, first_name, last_name, registered_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id::text",
            )
            .bind(&principal.email)
            .bind(&principal.password_hash)
            .bind(&principal.first_name)
            .bind(&principal.last_name)
            .bind(Utc::now()),
            Audience::Admin => sqlx::query_scalar::<_, String>(
                "INSERT INTO admins (email, password_hash, created_at) VALUES ($1, $2, $3) RETURNING id::text",
            )
            .bind(&principal.email)
            .bind(&principal.password_hash)
            .bind(Utc::now()),
        };

        Ok(query.fetch_one(self.pool.as_ref()).await?)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session, cap: usize) -> Result<(), DatabaseError> {
        let mut transaction = self.begin_transaction().await?;
        self.lock_principal(&session.principal_id, &mut transaction).await?;

        let count = format!(
            "SELECT COUNT(*) FROM {} WHERE principal_id = $1::uuid",
            tables(self.audience).sessions
        );
        let held = sqlx::query_scalar::<_, i64>(&count)
            .bind(&session.principal_id)
            .fetch_one(&mut *transaction)
            .await?;

        if held as usize >= cap {
            self.delete_by_principal(&session.principal_id, &mut transaction).await?;
        }
        self.insert_row(session, &mut transaction).await?;

        transaction.commit().await?;
        Ok(())
    }

    async fn find_session_by_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE refresh_token = $1",
            SESSION_COLUMNS,
            tables(self.audience).sessions
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(refresh_token)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(session)
    }

    async fn count_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE principal_id = $1::uuid",
            tables(self.audience).sessions
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(principal_id)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(count as u64)
    }

    async fn delete_sessions_by_principal(&self, principal_id: &str) -> Result<u64, DatabaseError> {
        let mut transaction = self.begin_transaction().await?;
        self.lock_principal(principal_id, &mut transaction).await?;
        let deleted = self.delete_by_principal(principal_id, &mut transaction).await?;
        transaction.commit().await?;
        Ok(deleted)
    }

    async fn rotate_session(
        &self,
        refresh_token: &str,
        replacement: &SessionReplacement,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, DatabaseError> {
        let sessions = tables(self.audience).sessions;
        let mut transaction = self.begin_transaction().await?;

        let owner = format!("SELECT principal_id::text FROM {} WHERE refresh_token = $1", sessions);
        let principal_id = sqlx::query_scalar::<_, String>(&owner)
            .bind(refresh_token)
            .fetch_optional(&mut *transaction)
            .await?;
        let Some(principal_id) = principal_id else {
            transaction.rollback().await?;
            return Ok(None);
        };
        self.lock_principal(&principal_id, &mut transaction).await?;

        // Holding the principal lock, a losing concurrent rotation finds the
        // token already gone.
        let consume = format!(
            "DELETE FROM {} WHERE refresh_token = $1 AND expires_at > $2 RETURNING {}",
            sessions, SESSION_COLUMNS
        );
        let consumed = sqlx::query_as::<_, Session>(&consume)
            .bind(refresh_token)
            .bind(now)
            .fetch_optional(&mut *transaction)
            .await?;

        let Some(consumed) = consumed else {
            transaction.rollback().await?;
            return Ok(None);
        };

        self.delete_by_principal(&consumed.principal_id, &mut transaction).await?;
        let session = replacement.clone().into_session(&consumed);
        self.insert_row(&session, &mut transaction).await?;

        transaction.commit().await?;
        Ok(Some(session))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let sql = format!("DELETE FROM {} WHERE expires_at <= $1", tables(self.audience).sessions);
        let result = sqlx::query(&sql)
            .bind(now)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
