use axum::extract::{Path, Query, State};
use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::amortization::{self, AmortizationInput};

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

/// Both `/api/assets` and `/api/insurance` are rows in `manual_assets`,
/// distinguished only by `asset_type` — the insurance surface is the general
/// asset CRUD with the type pinned.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    General,
    Insurance,
}

#[derive(Deserialize)]
pub struct CreateAssetRequest {
    asset_type: Option<String>,
    current_value: f64,
    valuation_source: Option<String>,
    value_as_of: Option<String>,
    principal: Option<f64>,
    annual_rate: Option<f64>,
    start_date: Option<String>,
    term_months: Option<i64>,
    extra: Option<Value>,
}

#[derive(Deserialize)]
pub struct NotePaymentRequest {
    payment_date: String,
    amount: f64,
}

pub async fn list(state: State<AppState>, user: AuthUser, scope: Scope) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, asset_type, current_value, valuation_source, value_as_of, active, \
                principal, annual_rate, start_date, term_months, extra_json \
         FROM manual_assets WHERE user_id = ?1 AND (?2 = (asset_type = 'insurance'))",
    )?;
    let is_insurance = scope == Scope::Insurance;
    let rows = stmt
        .query_map(params![user.user_id, is_insurance], row_to_value)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

pub async fn list_assets(state: State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    list(state, user, Scope::General).await
}

pub async fn list_insurance(state: State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    list(state, user, Scope::Insurance).await
}

async fn create(
    state: State<AppState>,
    user: AuthUser,
    scope: Scope,
    req: CreateAssetRequest,
) -> Result<axum::Json<Value>, ApiError> {
    let asset_type = match scope {
        Scope::Insurance => "insurance".to_string(),
        Scope::General => {
            let asset_type = req.asset_type.unwrap_or_default();
            if asset_type.is_empty() || asset_type == "insurance" {
                return Err(ApiError::Validation(vec!["assetType is required and must not be 'insurance'".into()]));
            }
            asset_type
        }
    };

    let db = state.inner.read().await.db.clone();
    let id = Uuid::new_v4().to_string();
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO manual_assets \
            (id, user_id, asset_type, current_value, valuation_source, value_as_of, \
             principal, annual_rate, start_date, term_months, extra_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id,
            user.user_id,
            asset_type,
            req.current_value,
            req.valuation_source,
            req.value_as_of,
            req.principal,
            req.annual_rate,
            req.start_date,
            req.term_months,
            req.extra.map(|v| v.to_string()),
        ],
    )?;
    drop(conn);

    get_one(state, user, &id).await
}

pub async fn create_asset(
    state: State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<CreateAssetRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    create(state, user, Scope::General, req).await
}

pub async fn create_insurance(
    state: State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<CreateAssetRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    create(state, user, Scope::Insurance, req).await
}

async fn get_one(state: State<AppState>, user: AuthUser, id: &str) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let row = conn
        .query_row(
            "SELECT id, asset_type, current_value, valuation_source, value_as_of, active, \
                    principal, annual_rate, start_date, term_months, extra_json \
             FROM manual_assets WHERE id = ?1 AND user_id = ?2",
            params![id, user.user_id],
            row_to_value,
        )
        .optional()?
        .ok_or_else(|| ApiError::NotFound("asset not found".into()))?;
    Ok(data(row))
}

/// Allowlisted PUT fields — anything else in the body is ignored; an empty
/// or all-unknown body is a 400.
const UPDATABLE_FIELDS: &[&str] = &[
    "currentValue",
    "valuationSource",
    "valueAsOf",
    "active",
    "principal",
    "annualRate",
    "startDate",
    "termMonths",
    "extra",
];

pub async fn update(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<Value>,
) -> Result<axum::Json<Value>, ApiError> {
    let Value::Object(fields) = body else {
        return Err(ApiError::BadRequest("No valid fields".into()));
    };

    let mut set_clauses = Vec::new();
    let mut bound: Vec<(String, rusqlite::types::Value)> = Vec::new();

    for key in UPDATABLE_FIELDS {
        let Some(value) = fields.get(*key) else { continue };
        let column = match *key {
            "currentValue" => "current_value",
            "valuationSource" => "valuation_source",
            "valueAsOf" => "value_as_of",
            "active" => "active",
            "principal" => "principal",
            "annualRate" => "annual_rate",
            "startDate" => "start_date",
            "termMonths" => "term_months",
            "extra" => "extra_json",
            _ => continue,
        };
        let bind_value = if *key == "extra" {
            rusqlite::types::Value::Text(value.to_string())
        } else {
            json_to_sql(value)
        };
        set_clauses.push(format!("{column} = ?"));
        bound.push((column.to_string(), bind_value));
    }

    if set_clauses.is_empty() {
        return Err(ApiError::BadRequest("No valid fields".into()));
    }

    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let sql = format!("UPDATE manual_assets SET {} WHERE id = ? AND user_id = ?", set_clauses.join(", "));
    let mut params_vec: Vec<rusqlite::types::Value> = bound.into_iter().map(|(_, v)| v).collect();
    params_vec.push(rusqlite::types::Value::Text(id.clone()));
    params_vec.push(rusqlite::types::Value::Text(user.user_id.clone()));

    let changed = conn.execute(&sql, rusqlite::params_from_iter(params_vec))?;
    drop(conn);

    if changed == 0 {
        return Err(ApiError::NotFound("asset not found".into()));
    }
    get_one(State(state), user, &id).await
}

pub async fn delete(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let changed = conn.execute("DELETE FROM manual_assets WHERE id = ?1 AND user_id = ?2", params![id, user.user_id])?;
    if changed == 0 {
        return Err(ApiError::NotFound("asset not found".into()));
    }
    Ok(data(json!({ "deleted": true })))
}

pub async fn note_payment(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<NotePaymentRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let note = load_note(&db, &id, &user.user_id).await?;

    let payments_made_before: u32 = {
        let conn = db.lock().await;
        conn.query_row("SELECT COUNT(*) FROM note_payments WHERE asset_id = ?1", params![id], |row| row.get(0))?
    };

    let start = NaiveDate::parse_from_str(&note.start_date, "%Y-%m-%d")
        .map_err(|_| ApiError::Internal("asset has an invalid start_date".into()))?;

    let result = amortization::amortize(&AmortizationInput {
        principal: note.principal,
        annual_rate_percent: note.annual_rate,
        term_months: note.term_months as u32,
        start_date: start,
        payments_made: Some(payments_made_before + 1),
        include_schedule: true,
    });
    let schedule = result.schedule.as_ref().ok_or_else(|| ApiError::Internal("schedule missing".into()))?;
    let this_payment = schedule
        .get(payments_made_before as usize)
        .ok_or_else(|| ApiError::BadRequest("note is already fully paid off".into()))?;

    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO note_payments (id, asset_id, payment_date, amount, principal_portion, interest_portion, balance_after) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            id,
            req.payment_date,
            req.amount,
            this_payment.principal,
            this_payment.interest,
            this_payment.balance,
        ],
    )?;
    conn.execute("UPDATE manual_assets SET current_value = ?1 WHERE id = ?2", params![this_payment.balance, id])?;
    drop(conn);

    Ok(data(json!({
        "principalPortion": this_payment.principal,
        "interestPortion": this_payment.interest,
        "balanceAfter": this_payment.balance,
    })))
}

pub async fn history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    ensure_owned(&db, &id, &user.user_id).await?;

    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT recorded_date, value, source FROM asset_value_history WHERE asset_id = ?1 ORDER BY recorded_date ASC",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok(json!({ "date": row.get::<_, String>(0)?, "value": row.get::<_, f64>(1)?, "source": row.get::<_, Option<String>>(2)? }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

#[derive(Deserialize, Default)]
pub struct ScheduleQuery {
    #[serde(default)]
    schedule: bool,
}

pub async fn amortization_schedule(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Query(query): Query<ScheduleQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let note = load_note(&db, &id, &user.user_id).await?;
    let start = NaiveDate::parse_from_str(&note.start_date, "%Y-%m-%d")
        .map_err(|_| ApiError::Internal("asset has an invalid start_date".into()))?;

    let result = amortization::amortize(&AmortizationInput {
        principal: note.principal,
        annual_rate_percent: note.annual_rate,
        term_months: note.term_months as u32,
        start_date: start,
        payments_made: None,
        include_schedule: query.schedule,
    });
    Ok(data(result))
}

pub async fn payments(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    ensure_owned(&db, &id, &user.user_id).await?;

    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT payment_date, amount, principal_portion, interest_portion, balance_after \
         FROM note_payments WHERE asset_id = ?1 ORDER BY payment_date ASC",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            Ok(json!({
                "date": row.get::<_, String>(0)?,
                "amount": row.get::<_, f64>(1)?,
                "principalPortion": row.get::<_, f64>(2)?,
                "interestPortion": row.get::<_, f64>(3)?,
                "balanceAfter": row.get::<_, f64>(4)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

struct NoteRow {
    principal: f64,
    annual_rate: f64,
    start_date: String,
    term_months: i64,
}

async fn load_note(db: &crate::storage::Db, id: &str, user_id: &str) -> Result<NoteRow, ApiError> {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT principal, annual_rate, start_date, term_months FROM manual_assets \
         WHERE id = ?1 AND user_id = ?2 AND asset_type IN ('note_receivable', 'note_payable')",
        params![id, user_id],
        |row| {
            Ok(NoteRow {
                principal: row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                annual_rate: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                start_date: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                term_months: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            })
        },
    )
    .optional()
    .map_err(ApiError::from)?
    .ok_or_else(|| ApiError::NotFound("note asset not found".into()))
}

async fn ensure_owned(db: &crate::storage::Db, id: &str, user_id: &str) -> Result<(), ApiError> {
    let conn = db.lock().await;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM manual_assets WHERE id = ?1 AND user_id = ?2", params![id, user_id], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(ApiError::NotFound("asset not found".into()));
    }
    Ok(())
}

fn row_to_value(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "assetType": row.get::<_, String>(1)?,
        "currentValue": row.get::<_, f64>(2)?,
        "valuationSource": row.get::<_, Option<String>>(3)?,
        "valueAsOf": row.get::<_, Option<String>>(4)?,
        "active": row.get::<_, i64>(5)? != 0,
        "principal": row.get::<_, Option<f64>>(6)?,
        "annualRate": row.get::<_, Option<f64>>(7)?,
        "startDate": row.get::<_, Option<String>>(8)?,
        "termMonths": row.get::<_, Option<i64>>(9)?,
        "extra": row.get::<_, Option<String>>(10)?.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
    }))
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}
