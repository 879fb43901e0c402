use actix_web::middleware::from_fn;
use actix_web::{web, App, HttpServer};
use adsboard_auth::auth::middleware::rate_limit;
use adsboard_auth::{cors, routes, AppError, AppState, Settings};
use dotenv::dotenv;
use std::net::TcpListener;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How often expired session rows are purged from both session tables.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[actix_web::main]
async fn main() -> adsboard_auth::Result<()> {
    dotenv().ok();

    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Settings::new()?;
    info!("Configuration loaded successfully ({})", config.environment);

    // Fails before serving traffic on a bad signing key, salt or database.
    let state = AppState::new(config.clone()).await?;

    let sweeper = state.rate_limiter.clone().spawn_sweeper();

    let purge_state = state.clone();
    let purger = tokio::spawn(async move {
        loop {
            tokio::time::sleep(SESSION_PURGE_INTERVAL).await;
            for auth in [&purge_state.user_auth, &purge_state.admin_auth] {
                match auth.purge_expired_sessions().await {
                    Ok(0) => {}
                    Ok(n) => info!("Purged {} expired {} sessions", n, auth.audience()),
                    Err(e) => error!("Failed to purge expired {} sessions: {}", auth.audience(), e),
                }
            }
        }
    });

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Listening on http://{}:{}", config.server.host, config.server.port);

    let data = web::Data::new(state.clone());
    let server_config = config.clone();
    let result = HttpServer::new(move || {
        App::new()
            .wrap(from_fn(rate_limit))
            .wrap(cors(&server_config))
            .app_data(data.clone())
            .configure(routes)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .client_request_timeout(config.server.request_timeout())
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()));

    info!("Server stopped, shutting down");
    sweeper.abort();
    purger.abort();
    state.shutdown().await?;

    result
}
