use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::SET_COOKIE;
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth;
use crate::storage;

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Deserialize)]
pub struct RegisterRequest {
    email: String,
    password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Deserialize, Default)]
pub struct RefreshRequest {
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateMeRequest {
    email: Option<String>,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

pub async fn register(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<RegisterRequest>,
) -> Result<(HeaderMap, axum::Json<serde_json::Value>), ApiError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation(vec!["a valid email is required".into()]));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(vec![format!("password must be at least {MIN_PASSWORD_LEN} characters")]));
    }

    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let config = inner.config.clone();
    drop(inner);

    let existing: Option<String> = {
        let conn = db.lock().await;
        conn.query_row("SELECT id FROM users WHERE email = ?1", params![email], |row| row.get(0))
            .optional()?
    };
    if existing.is_some() {
        return Err(ApiError::Conflict("an account with that email already exists".into()));
    }

    let user_id = Uuid::new_v4().to_string();
    let password_hash = auth::hash_password(&req.password)?;
    {
        let conn = db.lock().await;
        conn.execute(
            "INSERT INTO users (id, email, password_hash) VALUES (?1, ?2, ?3)",
            params![user_id, email, password_hash],
        )?;
    }

    issue_session(&db, &config, &user_id, &email, "free").await
}

pub async fn login(
    State(state): State<AppState>,
    axum::Json(req): axum::Json<LoginRequest>,
) -> Result<(HeaderMap, axum::Json<serde_json::Value>), ApiError> {
    let email = req.email.trim().to_lowercase();

    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let config = inner.config.clone();
    drop(inner);

    let row: Option<(String, String, String)> = {
        let conn = db.lock().await;
        conn.query_row(
            "SELECT id, password_hash, plan FROM users WHERE email = ?1",
            params![email],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    };

    let Some((user_id, password_hash, plan)) = row else {
        return Err(ApiError::Unauthorized("invalid email or password".into()));
    };
    if !auth::verify_password(&req.password, &password_hash) {
        return Err(ApiError::Unauthorized("invalid email or password".into()));
    }

    issue_session(&db, &config, &user_id, &email, &plan).await
}

/// Rotate the refresh token atomically: the presented token must still have
/// a live row, which is deleted in the same transaction that inserts its
/// replacement — reuse of an already-rotated token is rejected.
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<axum::Json<RefreshRequest>>,
) -> Result<(HeaderMap, axum::Json<serde_json::Value>), ApiError> {
    let token = body
        .and_then(|b| b.0.refresh_token)
        .or_else(|| cookie_from_headers(&headers, "refreshToken"))
        .ok_or_else(|| ApiError::Unauthorized("missing refresh token".into()))?;

    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let config = inner.config.clone();
    drop(inner);

    let claims = auth::verify_token(&token, &config.jwt_refresh_secret, "refresh")
        .map_err(|_| ApiError::Unauthorized("invalid or expired refresh token".into()))?;
    let token_hash = auth::hash_refresh_token(&token);

    let row: Option<(String, String)> = {
        let conn = db.lock().await;
        conn.query_row(
            "SELECT u.email, u.plan FROM refresh_tokens rt JOIN users u ON u.id = rt.user_id \
             WHERE rt.token_hash = ?1 AND rt.user_id = ?2 AND rt.expires_at > unixepoch()",
            params![token_hash, claims.sub],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
    };
    let Some((email, plan)) = row else {
        return Err(ApiError::Unauthorized("refresh token has been revoked or expired".into()));
    };

    storage::transaction(&db, move |conn| {
        conn.execute("DELETE FROM refresh_tokens WHERE token_hash = ?1", params![token_hash])?;
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    issue_session(&db, &config, &claims.sub, &email, &plan).await
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(HeaderMap, axum::Json<serde_json::Value>), ApiError> {
    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let is_production = inner.config.is_production();
    drop(inner);

    if let Some(token) = cookie_from_headers(&headers, "refreshToken") {
        let token_hash = auth::hash_refresh_token(&token);
        let conn = db.lock().await;
        conn.execute("DELETE FROM refresh_tokens WHERE token_hash = ?1", params![token_hash])?;
    }

    let mut response_headers = HeaderMap::new();
    response_headers.append(SET_COOKIE, clear_cookie("accessToken", "/", is_production).parse().unwrap());
    response_headers.append(SET_COOKIE, clear_cookie("refreshToken", "/api/auth", is_production).parse().unwrap());
    Ok((response_headers, data(json!({ "loggedOut": true }))))
}

pub async fn me(user: AuthUser) -> Result<axum::Json<serde_json::Value>, ApiError> {
    Ok(data(json!({ "id": user.user_id, "email": user.email, "plan": user.plan })))
}

pub async fn update_me(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<UpdateMeRequest>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    let Some(email) = req.email.map(|e| e.trim().to_lowercase()) else {
        return Err(ApiError::BadRequest("no valid fields to update".into()));
    };
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::Validation(vec!["a valid email is required".into()]));
    }

    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    conn.execute("UPDATE users SET email = ?1 WHERE id = ?2", params![email, user.user_id])?;
    drop(conn);

    Ok(data(json!({ "id": user.user_id, "email": email, "plan": user.plan })))
}

/// Also revokes every outstanding refresh token for the user, forcing
/// re-authentication everywhere else.
pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<ChangePasswordRequest>,
) -> Result<axum::Json<serde_json::Value>, ApiError> {
    if req.new_password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!("password must be at least {MIN_PASSWORD_LEN} characters")));
    }

    let db = state.inner.read().await.db.clone();
    let current_hash: String = {
        let conn = db.lock().await;
        conn.query_row("SELECT password_hash FROM users WHERE id = ?1", params![user.user_id], |row| row.get(0))?
    };
    if !auth::verify_password(&req.current_password, &current_hash) {
        return Err(ApiError::Unauthorized("current password is incorrect".into()));
    }

    let new_hash = auth::hash_password(&req.new_password)?;
    let user_id = user.user_id.clone();
    storage::transaction(&db, move |conn| {
        conn.execute("UPDATE users SET password_hash = ?1 WHERE id = ?2", params![new_hash, user_id])?;
        conn.execute("DELETE FROM refresh_tokens WHERE user_id = ?1", params![user_id])?;
        Ok::<_, anyhow::Error>(())
    })
    .await?;

    Ok(data(json!({ "passwordChanged": true })))
}

async fn issue_session(
    db: &storage::Db,
    config: &crate::config::Config,
    user_id: &str,
    email: &str,
    plan: &str,
) -> Result<(HeaderMap, axum::Json<serde_json::Value>), ApiError> {
    let access_token = auth::create_access_token(user_id, email, plan, &config.jwt_access_secret, config.access_token_minutes)?;
    let refresh_token = auth::create_refresh_token(user_id, email, plan, &config.jwt_refresh_secret, config.refresh_token_days)?;

    let token_hash = auth::hash_refresh_token(&refresh_token);
    let expires_at_offset = config.refresh_token_days * 86_400;
    {
        let conn = db.lock().await;
        conn.execute(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at) VALUES (?1, ?2, ?3, unixepoch() + ?4)",
            params![Uuid::new_v4().to_string(), user_id, token_hash, expires_at_offset],
        )?;
    }

    let mut headers = HeaderMap::new();
    headers.append(
        SET_COOKIE,
        set_cookie("accessToken", &access_token, "/", config.access_token_minutes * 60, config.is_production())
            .parse()
            .unwrap(),
    );
    headers.append(
        SET_COOKIE,
        set_cookie("refreshToken", &refresh_token, "/api/auth", expires_at_offset, config.is_production())
            .parse()
            .unwrap(),
    );

    Ok((
        headers,
        data(json!({
            "user": { "id": user_id, "email": email, "plan": plan },
            "accessToken": access_token,
            "refreshToken": refresh_token,
        })),
    ))
}

fn set_cookie(name: &str, value: &str, path: &str, max_age_seconds: i64, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!("{name}={value}; Path={path}; Max-Age={max_age_seconds}; HttpOnly; SameSite=Strict{secure_flag}")
}

fn clear_cookie(name: &str, path: &str, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!("{name}=; Path={path}; Max-Age=0; HttpOnly; SameSite=Strict{secure_flag}")
}

fn cookie_from_headers(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get("cookie")?.to_str().ok()?;
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')) {
            return Some(value.to_string());
        }
    }
    None
}
