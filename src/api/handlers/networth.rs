use axum::extract::{Query, State};
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::networth;

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

pub async fn current(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let row = conn
        .query_row(
            "SELECT snapshot_date, total_assets, total_liabilities, net_worth FROM net_worth_snapshots \
             WHERE user_id = ?1 ORDER BY snapshot_date DESC LIMIT 1",
            params![user.user_id],
            |row| {
                Ok(json!({
                    "date": row.get::<_, String>(0)?,
                    "totalAssets": row.get::<_, f64>(1)?,
                    "totalLiabilities": row.get::<_, f64>(2)?,
                    "netWorth": row.get::<_, f64>(3)?,
                }))
            },
        )
        .optional()?
        .ok_or_else(|| ApiError::NotFound("no net worth snapshot yet".into()))?;
    Ok(data(row))
}

#[derive(Deserialize, Default)]
pub struct HistoryQuery {
    months: Option<i64>,
}

pub async fn history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let months = query.months.unwrap_or(12).clamp(1, 120);
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT snapshot_date, total_assets, total_liabilities, net_worth FROM net_worth_snapshots \
         WHERE user_id = ?1 AND snapshot_date >= date('now', ?2) ORDER BY snapshot_date ASC",
    )?;
    let rows = stmt
        .query_map(params![user.user_id, format!("-{months} months")], |row| {
            Ok(json!({
                "date": row.get::<_, String>(0)?,
                "totalAssets": row.get::<_, f64>(1)?,
                "totalLiabilities": row.get::<_, f64>(2)?,
                "netWorth": row.get::<_, f64>(3)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

pub async fn breakdown(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let breakdown_json: String = conn
        .query_row(
            "SELECT breakdown_json FROM net_worth_snapshots WHERE user_id = ?1 ORDER BY snapshot_date DESC LIMIT 1",
            params![user.user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ApiError::NotFound("no net worth snapshot yet".into()))?;

    let value: Value = serde_json::from_str(&breakdown_json)
        .map_err(|e| ApiError::Internal(format!("stored breakdown is not valid json: {e}")))?;
    Ok(data(value))
}

/// Recompute and persist a snapshot on demand — the same routine the nightly
/// scheduler job runs per user.
pub async fn snapshot(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let ledger = inner.ledger.clone();
    drop(inner);

    let result = networth::compute_snapshot(&db, ledger.as_ref(), &user.user_id).await?;
    Ok(data(result))
}
