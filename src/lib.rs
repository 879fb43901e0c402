pub mod auth;
pub mod config;
pub mod db;
pub mod error;

use std::sync::Arc;
use actix_cors::Cors;
use actix_web::middleware::from_fn;
use actix_web::{web, HttpResponse};
use sqlx::PgPool;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

pub use auth::{Audience, AuthService, RateLimiter, RateLimitConfig, TokenManager};
pub use db::{MemoryStore, PgStore, PrincipalStore, Session, SessionStore};

use auth::handlers::{admin_refresh, admin_sign_in, me, refresh, sign_in, sign_out, sign_up};
use auth::middleware::{require_admin, require_user};
use auth::SessionPolicy;

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub user_auth: Arc<AuthService>,
    pub admin_auth: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub db_pool: Option<Arc<PgPool>>,
}

impl AppState {
    /// Connects to PostgreSQL, applies migrations and wires both audiences to it.
    pub async fn new(config: Settings) -> Result<Self> {
        let pool = db::operations::connect(
            &config.database.url,
            config.database.max_connections,
            config.server.request_timeout(),
        )
        .await?;
        db::operations::run_migrations(&pool).await?;

        let pool = Arc::new(pool);
        let users = Arc::new(PgStore::new(pool.clone(), Audience::User));
        let admins = Arc::new(PgStore::new(pool.clone(), Audience::Admin));

        let mut state = Self::with_stores(config, users, admins)?;
        state.db_pool = Some(pool);
        Ok(state)
    }

    /// Backs both audiences with separate in-process stores.
    pub fn in_memory(config: Settings) -> Result<Self> {
        Self::with_stores(config, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    /// Fails fast on an unusable signing key or an empty hashing salt.
    pub fn with_stores<U, A>(config: Settings, users: Arc<U>, admins: Arc<A>) -> Result<Self>
    where
        U: PrincipalStore + SessionStore + 'static,
        A: PrincipalStore + SessionStore + 'static,
    {
        let tokens = Arc::new(TokenManager::new(&config.auth.signing_key)?);
        let hasher = auth::password::from_config(&config.auth)?;

        let user_auth = AuthService::new(
            Audience::User,
            users.clone(),
            users,
            tokens.clone(),
            hasher.clone(),
            SessionPolicy::from_settings(&config, Audience::User),
        );
        let admin_auth = AuthService::new(
            Audience::Admin,
            admins.clone(),
            admins,
            tokens,
            hasher,
            SessionPolicy::from_settings(&config, Audience::Admin),
        );
        let rate_limiter = RateLimiter::new(RateLimitConfig::from(&config.rate_limit));

        Ok(Self {
            config: Arc::new(config),
            user_auth: Arc::new(user_auth),
            admin_auth: Arc::new(admin_auth),
            rate_limiter: Arc::new(rate_limiter),
            db_pool: None,
        })
    }

    pub fn auth(&self, audience: Audience) -> &AuthService {
        match audience {
            Audience::User => &self.user_auth,
            Audience::Admin => &self.admin_auth,
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(pool) = &self.db_pool {
            pool.close().await;
        }
        Ok(())
    }
}

/// Registered outside [`auth::middleware::rate_limit`], so preflight requests
/// are answered without spending rate-limit tokens.
pub fn cors(settings: &Settings) -> Cors {
    if !settings.cors.enabled {
        return Cors::default();
    }

    let cors = if settings.cors.allow_any_origin {
        Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
    } else {
        Cors::default()
            .allowed_origin("http://localhost:8080")
            .allowed_origin("http://127.0.0.1:8080")
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE"])
            .allowed_headers(vec!["Authorization", "Content-Type"])
    };

    cors.max_age(settings.cors.max_age as usize)
}

/// Registers every route. The caller wraps the app in
/// [`auth::middleware::rate_limit`] so it runs ahead of all of them.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::scope("/api/v1")
            .service(
                web::scope("/auth")
                    .route("/sign-up", web::post().to(sign_up))
                    .route("/sign-in", web::post().to(sign_in))
                    .route("/refresh", web::post().to(refresh))
                    .service(
                        web::scope("/api")
                            .wrap(from_fn(require_user))
                            .route("/sign-out", web::post().to(sign_out))
                            .route("/me", web::get().to(me)),
                    ),
            )
            .service(
                web::scope("/admins")
                    .route("/sign-in", web::post().to(admin_sign_in))
                    .route("/refresh", web::post().to(admin_refresh))
                    .service(
                        web::scope("/api")
                            .wrap(from_fn(require_admin))
                            .route("/sign-out", web::post().to(sign_out))
                            .route("/me", web::get().to(me)),
                    ),
            ),
    );
}
