use axum::extract::{Path, Query, State};
use rusqlite::params;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::alerts::{self, AlertEvent};

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

#[derive(Deserialize, Default)]
pub struct ListQuery {
    unread: Option<bool>,
    severity: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;

    let mut sql = "SELECT id, rule_type, severity, title, message, metadata_json, sent_at, read_at \
                    FROM alert_history WHERE user_id = ?1"
        .to_string();
    if query.unread == Some(true) {
        sql.push_str(" AND read_at IS NULL");
    }
    if query.severity.is_some() {
        sql.push_str(" AND severity = ?2");
    }
    sql.push_str(" ORDER BY sent_at DESC LIMIT 200");

    let mut stmt = conn.prepare(&sql)?;
    let rows = if let Some(severity) = &query.severity {
        stmt.query_map(params![user.user_id, severity], row_to_value)?.collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![user.user_id], row_to_value)?.collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(data(rows))
}

pub async fn unread_count(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM alert_history WHERE user_id = ?1 AND read_at IS NULL",
        params![user.user_id],
        |row| row.get(0),
    )?;
    Ok(data(json!({ "count": count })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let changed = conn.execute(
        "UPDATE alert_history SET read_at = unixepoch() WHERE id = ?1 AND user_id = ?2",
        params![id, user.user_id],
    )?;
    if changed == 0 {
        return Err(ApiError::NotFound("alert not found".into()));
    }
    Ok(data(json!({ "read": true })))
}

pub async fn delete(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let changed = conn.execute("DELETE FROM alert_history WHERE id = ?1 AND user_id = ?2", params![id, user.user_id])?;
    if changed == 0 {
        return Err(ApiError::NotFound("alert not found".into()));
    }
    Ok(data(json!({ "deleted": true })))
}

pub async fn list_rules(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, rule_type, threshold, filter_json, severity, enabled, notify_push \
         FROM alert_rules WHERE user_id = ?1 ORDER BY rule_type",
    )?;
    let rows = stmt
        .query_map(params![user.user_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "type": row.get::<_, String>(1)?,
                "threshold": row.get::<_, Option<f64>>(2)?,
                "filter": row.get::<_, Option<String>>(3)?.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
                "severity": row.get::<_, String>(4)?,
                "enabled": row.get::<_, i64>(5)? != 0,
                "notifyPush": row.get::<_, i64>(6)? != 0,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

#[derive(Deserialize)]
pub struct CreateRuleRequest {
    #[serde(rename = "type")]
    rule_type: String,
    threshold: Option<f64>,
    filter: Option<Value>,
    severity: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    notify_push: bool,
}

fn default_true() -> bool {
    true
}

pub async fn create_rule(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<CreateRuleRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    if req.rule_type.trim().is_empty() {
        return Err(ApiError::Validation(vec!["type is required".into()]));
    }
    let severity = req.severity.unwrap_or_else(|| "warning".to_string());
    let id = Uuid::new_v4().to_string();

    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO alert_rules (id, user_id, rule_type, threshold, filter_json, severity, enabled, notify_push) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            user.user_id,
            req.rule_type,
            req.threshold,
            req.filter.map(|f| f.to_string()),
            severity,
            req.enabled,
            req.notify_push,
        ],
    )?;
    Ok(data(json!({ "id": id })))
}

const RULE_UPDATABLE_FIELDS: &[&str] = &["threshold", "severity", "enabled", "notifyPush", "filter"];

pub async fn update_rule(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<Value>,
) -> Result<axum::Json<Value>, ApiError> {
    let Value::Object(fields) = body else {
        return Err(ApiError::BadRequest("No valid fields".into()));
    };

    let mut set_clauses = Vec::new();
    let mut bound: Vec<rusqlite::types::Value> = Vec::new();
    for key in RULE_UPDATABLE_FIELDS {
        let Some(value) = fields.get(*key) else { continue };
        let column = match *key {
            "threshold" => "threshold",
            "severity" => "severity",
            "enabled" => "enabled",
            "notifyPush" => "notify_push",
            "filter" => "filter_json",
            _ => continue,
        };
        let bind_value = match (column, value) {
            ("filter_json", v) => rusqlite::types::Value::Text(v.to_string()),
            (_, Value::Bool(b)) => rusqlite::types::Value::Integer(*b as i64),
            (_, Value::Number(n)) => rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0)),
            (_, Value::String(s)) => rusqlite::types::Value::Text(s.clone()),
            _ => rusqlite::types::Value::Null,
        };
        set_clauses.push(format!("{column} = ?"));
        bound.push(bind_value);
    }

    if set_clauses.is_empty() {
        return Err(ApiError::BadRequest("No valid fields".into()));
    }

    bound.push(rusqlite::types::Value::Text(id.clone()));
    bound.push(rusqlite::types::Value::Text(user.user_id.clone()));

    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let sql = format!("UPDATE alert_rules SET {} WHERE id = ? AND user_id = ?", set_clauses.join(", "));
    let changed = conn.execute(&sql, rusqlite::params_from_iter(bound))?;
    if changed == 0 {
        return Err(ApiError::NotFound("rule not found".into()));
    }
    Ok(data(json!({ "updated": true })))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let changed = conn.execute("DELETE FROM alert_rules WHERE id = ?1 AND user_id = ?2", params![id, user.user_id])?;
    if changed == 0 {
        return Err(ApiError::NotFound("rule not found".into()));
    }
    Ok(data(json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub struct TestAlertRequest {
    #[serde(rename = "type")]
    event_type: String,
    amount: Option<f64>,
    balance: Option<f64>,
    institution: Option<String>,
    #[serde(rename = "accountName")]
    account_name: Option<String>,
    description: Option<String>,
}

/// Fires a synthetic event through the same evaluation path the scheduler and
/// upload/sync pipelines use, scoped to the caller so a user can preview
/// whether their rule configuration actually triggers.
pub async fn test(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<TestAlertRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let push = inner.push.clone();
    drop(inner);

    let event = AlertEvent {
        event_type: req.event_type,
        user_id: Some(user.user_id),
        institution: req.institution,
        account_name: req.account_name,
        amount: req.amount,
        balance: req.balance,
        description: req.description,
        metadata: None,
    };
    let fired = alerts::evaluate_event(&db, push.as_deref(), &event).await?;
    Ok(data(json!({ "fired": fired })))
}

fn row_to_value(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "type": row.get::<_, String>(1)?,
        "severity": row.get::<_, String>(2)?,
        "title": row.get::<_, String>(3)?,
        "message": row.get::<_, String>(4)?,
        "metadata": row.get::<_, Option<String>>(5)?.and_then(|s| serde_json::from_str::<Value>(&s).ok()),
        "sentAt": row.get::<_, i64>(6)?,
        "readAt": row.get::<_, Option<i64>>(7)?,
    }))
}
