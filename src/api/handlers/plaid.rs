use axum::extract::{Path, Query, State};
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::aggregator::sync::delta_sync;
use crate::auth;

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

#[derive(Deserialize)]
pub struct LinkTokenRequest {
    institution_name: String,
}

/// Opens a `pending` aggregator link row the client will complete via
/// `exchange` — a token-then-exchange handshake modeled after how
/// bank-aggregation providers link an institution without a live third party.
pub async fn link_token(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<LinkTokenRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    if req.institution_name.trim().is_empty() {
        return Err(ApiError::Validation(vec!["institutionName is required".into()]));
    }
    let link_id = Uuid::new_v4().to_string();

    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO institution_links (id, user_id, source_kind, institution_name, status) \
         VALUES (?1, ?2, 'aggregator', ?3, 'pending')",
        params![link_id, user.user_id, req.institution_name],
    )?;

    Ok(data(json!({ "linkToken": link_id })))
}

#[derive(Deserialize)]
pub struct ExchangeRequest {
    link_token: String,
    public_token: String,
}

pub async fn exchange(
    State(state): State<AppState>,
    user: AuthUser,
    axum::Json(req): axum::Json<ExchangeRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let key = auth::derive_process_key(&inner.config.encryption_key);
    drop(inner);

    let credential_enc = auth::encrypt_credential(&req.public_token, &key)?;

    let conn = db.lock().await;
    let changed = conn.execute(
        "UPDATE institution_links SET credential_enc = ?1, status = 'good' WHERE id = ?2 AND user_id = ?3 AND status = 'pending'",
        params![credential_enc, req.link_token, user.user_id],
    )?;
    if changed == 0 {
        return Err(ApiError::NotFound("no pending link matches that linkToken".into()));
    }
    Ok(data(json!({ "linked": true })))
}

pub async fn items(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, institution_name, status, last_synced_at FROM institution_links \
         WHERE user_id = ?1 AND source_kind = 'aggregator' ORDER BY institution_name",
    )?;
    let rows = stmt
        .query_map(params![user.user_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "institution": row.get::<_, String>(1)?,
                "status": row.get::<_, String>(2)?,
                "lastSyncedAt": row.get::<_, Option<i64>>(3)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

pub async fn sync_one(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    ensure_owned(&state, &user, &item_id).await?;
    let mut inner = state.inner.write().await;
    let db = inner.db.clone();
    let key = auth::derive_process_key(&inner.config.encryption_key);
    let aggregator = inner.aggregator.clone();
    let ledger = inner.ledger.clone();
    let outcome = delta_sync(&db, aggregator.as_ref(), ledger.as_ref(), &mut inner.ledger_account_cache, &key, &item_id).await?;
    Ok(data(outcome))
}

pub async fn sync_all(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let item_ids: Vec<String> = {
        let conn = db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id FROM institution_links WHERE user_id = ?1 AND source_kind = 'aggregator' AND status != 'pending'",
        )?;
        stmt.query_map(params![user.user_id], |row| row.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut synced = 0u32;
    let mut failed = 0u32;
    let mut inner = state.inner.write().await;
    let key = auth::derive_process_key(&inner.config.encryption_key);
    let aggregator = inner.aggregator.clone();
    let ledger = inner.ledger.clone();
    for item_id in &item_ids {
        match delta_sync(&db, aggregator.as_ref(), ledger.as_ref(), &mut inner.ledger_account_cache, &key, item_id).await {
            Ok(_) => synced += 1,
            Err(_) => failed += 1,
        }
    }
    Ok(data(json!({ "synced": synced, "failed": failed })))
}

pub async fn delete_item(
    State(state): State<AppState>,
    user: AuthUser,
    Path(item_id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let changed = conn.execute(
        "DELETE FROM institution_links WHERE id = ?1 AND user_id = ?2 AND source_kind = 'aggregator'",
        params![item_id, user.user_id],
    )?;
    if changed == 0 {
        return Err(ApiError::NotFound("item not found".into()));
    }
    Ok(data(json!({ "deleted": true })))
}

#[derive(Deserialize, Default)]
pub struct TransactionsQuery {
    account_id: Option<String>,
    limit: Option<i64>,
}

pub async fn transactions(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<TransactionsQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;

    let mut stmt = if query.account_id.is_some() {
        conn.prepare(
            "SELECT transaction_id, external_account_id, amount, name, merchant, pending, txn_date \
             FROM source_transactions WHERE user_id = ?1 AND external_account_id = ?2 ORDER BY txn_date DESC LIMIT ?3",
        )?
    } else {
        conn.prepare(
            "SELECT transaction_id, external_account_id, amount, name, merchant, pending, txn_date \
             FROM source_transactions WHERE user_id = ?1 ORDER BY txn_date DESC LIMIT ?2",
        )?
    };

    let rows = if let Some(account_id) = &query.account_id {
        stmt.query_map(params![user.user_id, account_id, limit], row_to_txn)?.collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![user.user_id, limit], row_to_txn)?.collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(data(rows))
}

#[derive(Deserialize)]
pub struct UpdateAccountRequest {
    hidden: bool,
}

pub async fn update_account(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    axum::Json(req): axum::Json<UpdateAccountRequest>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let changed = conn.execute(
        "UPDATE source_accounts SET hidden = ?1 WHERE id = ?2 AND user_id = ?3",
        params![req.hidden, id, user.user_id],
    )?;
    if changed == 0 {
        return Err(ApiError::NotFound("account not found".into()));
    }
    Ok(data(json!({ "hidden": req.hidden })))
}

/// Aggregator webhooks arrive unauthenticated and must always 200 per the
/// provider's retry contract. A `TRANSACTIONS/*_UPDATE` event enqueues a
/// targeted delta-sync for that item in the background rather than blocking
/// the ack on it; every other event is just logged, since the scheduler's own
/// poll loop is the source of truth for everything this doesn't cover.
pub async fn webhook(State(state): State<AppState>, axum::Json(payload): axum::Json<Value>) -> axum::Json<Value> {
    eprintln!("[aggregator webhook] {payload}");

    let webhook_type = payload.get("webhook_type").and_then(Value::as_str).unwrap_or("");
    let webhook_code = payload.get("webhook_code").and_then(Value::as_str).unwrap_or("");
    let item_id = payload.get("item_id").and_then(Value::as_str).map(str::to_string);

    if webhook_type.eq_ignore_ascii_case("TRANSACTIONS") && webhook_code.ends_with("_UPDATE") {
        if let Some(item_id) = item_id {
            crate::background::spawn_background("plaid::webhook_sync", async move {
                let mut inner = state.inner.write().await;
                let db = inner.db.clone();
                let key = auth::derive_process_key(&inner.config.encryption_key);
                let aggregator = inner.aggregator.clone();
                let ledger = inner.ledger.clone();
                if let Err(err) =
                    delta_sync(&db, aggregator.as_ref(), ledger.as_ref(), &mut inner.ledger_account_cache, &key, &item_id).await
                {
                    eprintln!("[plaid webhook] sync failed for item {item_id}: {err}");
                }
            });
        }
    }

    data(json!({ "received": true }))
}

async fn ensure_owned(state: &AppState, user: &AuthUser, item_id: &str) -> Result<(), ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM institution_links WHERE id = ?1 AND user_id = ?2",
            params![item_id, user.user_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(ApiError::NotFound("item not found".into()));
    }
    Ok(())
}

fn row_to_txn(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "accountId": row.get::<_, String>(1)?,
        "amount": row.get::<_, f64>(2)?,
        "name": row.get::<_, String>(3)?,
        "merchant": row.get::<_, Option<String>>(4)?,
        "pending": row.get::<_, i64>(5)? != 0,
        "date": row.get::<_, String>(6)?,
    }))
}
