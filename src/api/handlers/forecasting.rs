use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::forecast::{self, ForecastInputs};

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

pub async fn latest(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let row = conn
        .query_row(
            "SELECT id, horizon_months, scenarios_json, summary_json FROM forecast_snapshots \
             WHERE user_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![user.user_id],
            row_to_value,
        )
        .optional()?
        .ok_or_else(|| ApiError::NotFound("no forecast has been generated yet".into()))?;
    Ok(data(row))
}

pub async fn history(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, horizon_months, scenarios_json, summary_json FROM forecast_snapshots \
         WHERE user_id = ?1 ORDER BY created_at DESC LIMIT 50",
    )?;
    let rows = stmt.query_map(params![user.user_id], row_to_value)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

pub async fn get_one(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let row = conn
        .query_row(
            "SELECT id, horizon_months, scenarios_json, summary_json FROM forecast_snapshots \
             WHERE id = ?1 AND user_id = ?2",
            params![id, user.user_id],
            row_to_value,
        )
        .optional()?
        .ok_or_else(|| ApiError::NotFound("forecast not found".into()))?;
    Ok(data(row))
}

#[derive(Deserialize, Default)]
pub struct ForecastRequest {
    horizon_months: Option<u32>,
    withdrawal_rate: Option<f64>,
    inflation_rate: Option<f64>,
}

pub async fn generate(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<ForecastRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    run_forecast(state, user, req).await
}

/// `/api/forecasting/whatif` shares `forecast::generate`'s always-persist
/// behavior with `generate` above — there is no separate non-persisting
/// preview path (see DESIGN.md Open Question decision).
pub async fn whatif(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<ForecastRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    run_forecast(state, user, req).await
}

async fn run_forecast(state: AppState, user: AuthUser, req: ForecastRequest) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let default = ForecastInputs::default();
    let inputs = ForecastInputs::clamped(
        req.horizon_months.unwrap_or(default.horizon_months),
        req.withdrawal_rate.unwrap_or(default.withdrawal_rate),
        req.inflation_rate.unwrap_or(default.inflation_rate),
    );
    let seed = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0);

    let result = forecast::generate(&db, &user.user_id, &inputs, seed).await?;
    let Some((scenarios, summary)) = result else {
        return Err(ApiError::BadRequest(
            "at least 5 net worth snapshots are required before a forecast can be generated".into(),
        ));
    };
    Ok(data(json!({ "scenarios": scenarios, "summary": summary })))
}

fn row_to_value(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    let scenarios_json: String = row.get(2)?;
    let summary_json: String = row.get(3)?;
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "horizonMonths": row.get::<_, i64>(1)?,
        "scenarios": serde_json::from_str::<Value>(&scenarios_json).unwrap_or(Value::Null),
        "summary": serde_json::from_str::<Value>(&summary_json).unwrap_or(Value::Null),
    }))
}
