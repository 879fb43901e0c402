use std::future::{ready, Ready};

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{Payload, ServiceRequest, ServiceResponse};
use actix_web::http::header::AUTHORIZATION;
use actix_web::middleware::Next;
use actix_web::{web, Error, FromRequest, HttpMessage, HttpRequest};
use serde::Serialize;
use tracing::{error, warn};

use crate::auth::token::Audience;
use crate::error::{AppError, AuthError};
use crate::AppState;

/// The verified subject of the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPrincipal {
    pub principal_id: String,
    pub audience: Audience,
}

impl FromRequest for AuthenticatedPrincipal {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthenticatedPrincipal>()
                .cloned()
                .ok_or(AppError::AuthError(AuthError::Unauthorized)),
        )
    }
}

fn app_state(req: &ServiceRequest) -> Result<web::Data<AppState>, AppError> {
    req.app_data::<web::Data<AppState>>()
        .cloned()
        .ok_or_else(|| AppError::InternalError("application state not registered".into()))
}

/// Rejections are rendered here rather than returned as errors so that outer
/// middleware such as CORS still decorates them.
pub async fn rate_limit<B: MessageBody>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, Error> {
    let state = app_state(&req)?;

    let Some(client) = req.peer_addr().map(|addr| addr.ip()) else {
        error!("Request to {} has no peer address", req.path());
        let err = AppError::InternalError("missing peer address".into());
        return Ok(req.error_response(err).map_into_right_body());
    };

    if !state.rate_limiter.admit(client) {
        warn!("Rate limit exceeded for {} on {}", client, req.path());
        let err = AppError::AuthError(AuthError::RateLimited);
        return Ok(req.error_response(err).map_into_right_body());
    }

    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

/// Extracts the token from `Authorization: Bearer <token>`. The error is only
/// ever logged; clients see a uniform 401.
fn bearer_token(req: &ServiceRequest) -> Result<&str, &'static str> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .ok_or("missing authorization header")?
        .to_str()
        .map_err(|_| "authorization header is not visible ASCII")?;

    let mut parts = header.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("Bearer"), Some(""), None) => Err("empty bearer token"),
        (Some("Bearer"), Some(token), None) => Ok(token),
        (Some("Bearer"), _, _) => Err("malformed bearer header"),
        _ => Err("authorization scheme is not Bearer"),
    }
}

async fn authorize<B: MessageBody>(
    req: ServiceRequest,
    next: Next<B>,
    audience: Audience,
) -> Result<ServiceResponse<B>, Error> {
    let state = app_state(&req)?;

    let principal_id = match bearer_token(&req) {
        Ok(token) => state
            .auth(audience)
            .verify_access_token(token)
            .map_err(|e| {
                warn!("Rejected {} request to {}: {}", audience, req.path(), e);
                AppError::AuthError(AuthError::Unauthorized)
            })?,
        Err(reason) => {
            warn!("Rejected {} request to {}: {}", audience, req.path(), reason);
            return Err(AppError::AuthError(AuthError::Unauthorized).into());
        }
    };

    req.extensions_mut().insert(AuthenticatedPrincipal {
        principal_id,
        audience,
    });
    next.call(req).await
}

pub async fn require_user(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    authorize(req, next, Audience::User).await
}

pub async fn require_admin(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    authorize(req, next, Audience::Admin).await
}
