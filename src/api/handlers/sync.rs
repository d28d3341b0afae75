use axum::extract::{Path, Query, State};
use rusqlite::params;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::aggregator::sync::delta_sync;
use crate::auth;
use crate::networth;
use crate::scheduler::downloader::HttpOfxDownloader;
use crate::scheduler::ofx_sync::sync_all;

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

pub async fn status(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, source_kind, institution_name, status, last_error_message, last_synced_at \
         FROM institution_links WHERE user_id = ?1 ORDER BY institution_name",
    )?;
    let rows = stmt
        .query_map(params![user.user_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "sourceKind": row.get::<_, String>(1)?,
                "institution": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "lastError": row.get::<_, Option<String>>(4)?,
                "lastSyncedAt": row.get::<_, Option<i64>>(5)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

#[derive(Deserialize, Default)]
pub struct LogQuery {
    limit: Option<i64>,
}

pub async fn log(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<LogQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, institution, method, status, transactions_added, error_message, started_at, completed_at \
         FROM sync_log WHERE user_id = ?1 ORDER BY started_at DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![user.user_id, limit], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "institution": row.get::<_, String>(1)?,
                "method": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "transactionsAdded": row.get::<_, i64>(4)?,
                "error": row.get::<_, Option<String>>(5)?,
                "startedAt": row.get::<_, i64>(6)?,
                "completedAt": row.get::<_, Option<i64>>(7)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(data(rows))
}

/// Trigger an on-demand sync for one of the caller's institution links,
/// branching on `source_kind` the same way the scheduler's nightly jobs do,
/// just for a single link instead of the whole fleet. Fires in the
/// background and acknowledges immediately rather than blocking the request
/// on a potentially slow network round trip; `GET /api/sync/log` and
/// `GET /api/sync/status` are how the caller observes the outcome.
pub async fn force(
    State(state): State<AppState>,
    user: AuthUser,
    Path(link_id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let db = state.inner.read().await.db.clone();
    let (source_kind, institution_name): (String, String) = {
        let conn = db.lock().await;
        conn.query_row(
            "SELECT source_kind, institution_name FROM institution_links WHERE id = ?1 AND user_id = ?2",
            params![link_id, user.user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| ApiError::NotFound("institution link not found".into()))?
    };

    if source_kind != "aggregator" && source_kind != "ofx" {
        return Err(ApiError::BadRequest(format!("unknown source kind: {source_kind}")));
    }

    crate::background::spawn_background("sync::force", async move {
        let mut inner = state.inner.write().await;
        let config = inner.config.clone();
        let ledger = inner.ledger.clone();
        if source_kind == "aggregator" {
            let aggregator = inner.aggregator.clone();
            let key = auth::derive_process_key(&config.encryption_key);
            if let Err(err) =
                delta_sync(&db, aggregator.as_ref(), ledger.as_ref(), &mut inner.ledger_account_cache, &key, &link_id).await
            {
                eprintln!("[sync::force] aggregator sync failed for link {link_id}: {err}");
            }
        } else {
            let downloader =
                HttpOfxDownloader::new(inner.http.clone(), config.ofx_downloader_url.clone(), config.download_dir.clone());
            let push = inner.push.clone();
            let sync_state = inner.ofx_sync_state.clone();
            sync_all(
                &db,
                ledger.as_ref(),
                &mut inner.ledger_account_cache,
                &downloader,
                push.as_deref(),
                &sync_state,
                std::slice::from_ref(&institution_name),
            )
            .await;
        }
    });

    Ok(data(json!({ "triggered": true })))
}

pub async fn snapshot(State(state): State<AppState>, user: AuthUser) -> Result<axum::Json<Value>, ApiError> {
    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let ledger = inner.ledger.clone();
    drop(inner);
    let result = networth::compute_snapshot(&db, ledger.as_ref(), &user.user_id).await?;
    Ok(data(result))
}
