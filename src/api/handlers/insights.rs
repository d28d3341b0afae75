use axum::extract::State;
use chrono::{Datelike, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::insights;

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

/// `monthly_insights.summary_json` is written camelCase by
/// [`crate::insights::generate_monthly`]'s `persist`; this loads the latest
/// row as-is, or runs generation for the current month if none exists yet.
async fn load_latest(state: &AppState, user_id: &str) -> Result<Value, ApiError> {
    let db = state.inner.read().await.db.clone();
    let row: Option<(i32, u32, String)> = {
        let conn = db.lock().await;
        conn.query_row(
            "SELECT year, month, summary_json FROM monthly_insights WHERE user_id = ?1 \
             ORDER BY year DESC, month DESC LIMIT 1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    };

    if let Some((year, month, summary_json)) = row {
        let mut value: Value = serde_json::from_str(&summary_json)
            .map_err(|e| ApiError::Internal(format!("stored insights are not valid json: {e}")))?;
        if let Value::Object(map) = &mut value {
            map.insert("year".into(), json!(year));
            map.insert("month".into(), json!(month));
        }
        return Ok(value);
    }

    let now = Utc::now();
    let generated = insights::generate_monthly(&db, user_id, now.year(), now.month()).await?;
    Ok(json!({
        "year": generated.year,
        "month": generated.month,
        "totalIncome": generated.total_income,
        "totalSpending": generated.total_spending,
        "savingsRate": generated.savings_rate,
        "byCategory": generated.by_category,
        "emergencyFundMonths": generated.emergency_fund_months,
    }))
}

pub async fn latest(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    Ok(data(load_latest(&state, &user.user_id).await?))
}

pub async fn list(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT year, month, summary_json FROM monthly_insights WHERE user_id = ?1 \
         ORDER BY year DESC, month DESC LIMIT 24",
    )?;
    let rows = stmt
        .query_map(params![user.user_id], |row| {
            let summary_json: String = row.get(2)?;
            Ok((row.get::<_, i32>(0)?, row.get::<_, u32>(1)?, summary_json))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let values: Vec<Value> = rows
        .into_iter()
        .map(|(year, month, summary_json)| {
            let mut value: Value = serde_json::from_str(&summary_json).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut value {
                map.insert("year".into(), json!(year));
                map.insert("month".into(), json!(month));
            }
            value
        })
        .collect();
    Ok(data(values))
}

#[derive(Deserialize, Default)]
pub struct GenerateRequest {
    year: Option<i32>,
    month: Option<u32>,
}

pub async fn generate(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<GenerateRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    let now = Utc::now();
    let year = req.year.unwrap_or_else(|| now.year());
    let month = req.month.unwrap_or_else(|| now.month());
    if !(1..=12).contains(&month) {
        return Err(ApiError::Validation(vec!["month must be between 1 and 12".into()]));
    }

    let db = state.inner.read().await.db.clone();
    let result = insights::generate_monthly(&db, &user.user_id, year, month).await?;
    Ok(data(result))
}

pub async fn spending(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let value = load_latest(&state, &user.user_id).await?;
    Ok(data(json!({ "totalSpending": value.get("totalSpending").cloned().unwrap_or(Value::Null) })))
}

pub async fn categories(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let value = load_latest(&state, &user.user_id).await?;
    Ok(data(value.get("byCategory").cloned().unwrap_or(json!([]))))
}

pub async fn savings_rate(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let value = load_latest(&state, &user.user_id).await?;
    Ok(data(json!({ "savingsRate": value.get("savingsRate").cloned().unwrap_or(Value::Null) })))
}

pub async fn emergency_fund(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let value = load_latest(&state, &user.user_id).await?;
    Ok(data(json!({ "months": value.get("emergencyFundMonths").cloned().unwrap_or(Value::Null) })))
}
