use actix_web::http::header::USER_AGENT;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::middleware::AuthenticatedPrincipal;
use crate::auth::service::{AuthService, Credentials, SignUpInput};
use crate::db::models::ClientMeta;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct SignUpResponse {
    pub id: String,
}

fn client_meta(req: &HttpRequest) -> ClientMeta {
    ClientMeta {
        user_agent: req
            .headers()
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string),
        client_ip: req.peer_addr().map(|addr| addr.ip().to_string()),
    }
}

async fn sign_in_with(
    service: &AuthService,
    http: &HttpRequest,
    req: SignInRequest,
) -> Result<HttpResponse, AppError> {
    info!("Received {} sign-in request for email: {}", service.audience(), req.email);
    let credentials = Credentials {
        email: req.email,
        password: req.password,
    };
    match service.sign_in(&credentials, &client_meta(http)).await {
        Ok(tokens) => Ok(HttpResponse::Ok().json(tokens)),
        Err(e) => {
            warn!("{} sign-in failed for email: {}: {}", service.audience(), credentials.email, e);
            Err(e)
        }
    }
}

async fn refresh_with(
    service: &AuthService,
    http: &HttpRequest,
    req: RefreshRequest,
) -> Result<HttpResponse, AppError> {
    let tokens = service
        .refresh_session(&req.refresh_token, &client_meta(http))
        .await?;
    Ok(HttpResponse::Ok().json(tokens))
}

pub async fn sign_up(
    req: web::Json<SignUpRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!("Received registration request for email: {}", req.email);
    let req = req.into_inner();
    let input = SignUpInput {
        email: req.email,
        password: req.password,
        first_name: req.first_name,
        last_name: req.last_name,
    };

    let id = state.user_auth.sign_up(&input).await?;
    Ok(HttpResponse::Created().json(SignUpResponse { id }))
}

pub async fn sign_in(
    http: HttpRequest,
    req: web::Json<SignInRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    sign_in_with(&state.user_auth, &http, req.into_inner()).await
}

pub async fn refresh(
    http: HttpRequest,
    req: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    refresh_with(&state.user_auth, &http, req.into_inner()).await
}

pub async fn admin_sign_in(
    http: HttpRequest,
    req: web::Json<SignInRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    sign_in_with(&state.admin_auth, &http, req.into_inner()).await
}

pub async fn admin_refresh(
    http: HttpRequest,
    req: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    refresh_with(&state.admin_auth, &http, req.into_inner()).await
}

/// Works for both audiences; the middleware already pinned which one.
pub async fn sign_out(
    principal: AuthenticatedPrincipal,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    state
        .auth(principal.audience)
        .sign_out(&principal.principal_id)
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "message": "Successfully signed out"
    })))
}

pub async fn me(principal: AuthenticatedPrincipal) -> HttpResponse {
    HttpResponse::Ok().json(principal)
}
