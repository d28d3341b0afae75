use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::auth;

use super::error::ApiError;
use super::rate_limit::{AUTH, GLOBAL};
use super::state::AppState;

pub struct AuthUser {
    pub user_id: String,
    pub email: String,
    pub plan: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).or_else(|| cookie_value(parts, "accessToken"))
            .ok_or_else(|| ApiError::Unauthorized("missing authorization".into()))?;

        let inner = state.inner.read().await;
        let claims = auth::verify_token(&token, &inner.config.jwt_access_secret, "access")
            .map_err(|_| ApiError::Unauthorized("invalid or expired token".into()))?;

        Ok(AuthUser {
            user_id: claims.sub,
            email: claims.email,
            plan: claims.plan,
        })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Minimal `Cookie:` header lookup — a single `name=value` scan is all the
/// cookie fallback needs, no cookie-jar crate required.
fn cookie_value(parts: &Parts, name: &str) -> Option<String> {
    let header = parts.headers.get("cookie")?.to_str().ok()?;
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')) {
            return Some(value.to_string());
        }
    }
    None
}

/// Asserts a user's plan is at least `required`, else 403. Plans are
/// ordered free < pro < lifetime.
pub fn require_plan(user: &AuthUser, required: &str) -> Result<(), ApiError> {
    fn rank(plan: &str) -> u8 {
        match plan {
            "lifetime" => 2,
            "pro" => 1,
            _ => 0,
        }
    }
    if rank(&user.plan) >= rank(required) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!("requires {required} plan")))
    }
}

/// 200 req / 15 min per client IP, applied to the whole API.
pub async fn global_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    check(&state, GLOBAL, &addr.ip().to_string()).await?;
    Ok(next.run(request).await)
}

/// 20 req / 15 min per client IP, applied to `/api/auth/*` on top of the
/// global limit — stricter because credential-stuffing and refresh-token
/// abuse both hit this surface.
pub async fn auth_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    check(&state, AUTH, &addr.ip().to_string()).await?;
    Ok(next.run(request).await)
}

async fn check(state: &AppState, limit: (&'static str, super::rate_limit::Limit), key: &str) -> Result<(), ApiError> {
    let inner = state.inner.read().await;
    inner
        .rate_limiter
        .check((limit.0, &limit.1), key)
        .await
        .map_err(|retry_after| ApiError::RateLimited(format!("rate limit exceeded, retry after {retry_after}s")))
}
