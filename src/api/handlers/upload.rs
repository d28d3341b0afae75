use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Multipart, State};
use serde_json::{Value, json};

use crate::alerts::{self, AlertEvent};
use crate::categorize;
use crate::ledger::{self, account::upsert_account, txns::upsert_transactions};
use crate::parsers::{CsvProfile, ParseResult, Parser};

use super::super::error::ApiError;
use super::super::middleware::AuthUser;
use super::super::state::AppState;
use super::data;

const ALLOWED_EXTENSIONS: &[&str] = &["ofx", "qfx", "csv", "txt"];
const MAX_BYTES: usize = 50 * 1024 * 1024;

/// Accepts a single bank/brokerage export file, parses it, and pushes any
/// resulting transactions into the ledger. The request body is already
/// capped at 50MB by `RequestBodyLimitLayer`; this re-checks so a malformed
/// multipart stream can't stream past the intent of the cap before axum's
/// limit kicks in. The uploaded file is written to disk under the millis-
/// timestamped temp name, then removed once import finishes either way.
pub async fn upload(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<axum::Json<Value>, ApiError> {
    let mut institution: Option<String> = None;
    let mut csv_profile: Option<CsvProfile> = None;
    let mut is_broker_positions = false;
    let mut is_broker_activity = false;
    let mut file_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::BadRequest(e.to_string()))? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "institution" => institution = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?),
            "brokerPositions" => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                is_broker_positions = text == "true" || text == "1";
            }
            "brokerActivity" => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                is_broker_activity = text == "true" || text == "1";
            }
            "csvProfile" => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                csv_profile = Some(parse_csv_profile(&text)?);
            }
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                if bytes.len() > MAX_BYTES {
                    return Err(ApiError::BadRequest("file exceeds the 50MB upload limit".into()));
                }
                file_bytes = Some(bytes.to_vec());
            }
            _ => {}
        }
    }

    let institution = institution.ok_or_else(|| ApiError::Validation(vec!["institution is required".into()]))?;
    let file_name = file_name.ok_or_else(|| ApiError::Validation(vec!["file is required".into()]))?;
    let file_bytes = file_bytes.ok_or_else(|| ApiError::Validation(vec!["file is required".into()]))?;

    let extension = file_name.rsplit('.').next().unwrap_or("").to_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ApiError::BadRequest(format!("unsupported file extension: .{extension}")));
    }
    let sanitized_name = sanitize_filename(&file_name);

    let contents = String::from_utf8_lossy(&file_bytes).into_owned();

    let inner = state.inner.read().await;
    let db = inner.db.clone();
    let ledger = inner.ledger.clone();
    let config = inner.config.clone();
    let llm_api_key = config.llm_api_key.clone();
    let llm_base_url = config.llm_base_url.clone();
    let http = inner.http.clone();
    let push = inner.push.clone();
    drop(inner);

    let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    let upload_path = config.upload_dir.join(format!("{millis}-{sanitized_name}"));
    if let Err(e) = tokio::fs::create_dir_all(&config.upload_dir).await {
        return Err(ApiError::Internal(format!("could not create upload directory: {e}")));
    }
    if let Err(e) = tokio::fs::write(&upload_path, &file_bytes).await {
        return Err(ApiError::Internal(format!("could not persist uploaded file: {e}")));
    }

    let result = process_upload(
        &db,
        ledger.as_ref(),
        push.as_deref(),
        llm_api_key.as_deref(),
        &llm_base_url,
        &http,
        &user.user_id,
        &institution,
        &contents,
        csv_profile,
        is_broker_positions,
        is_broker_activity,
    )
    .await;

    tokio::fs::remove_file(&upload_path).await.ok();
    result
}

#[allow(clippy::too_many_arguments)]
async fn process_upload(
    db: &crate::storage::Db,
    ledger: &dyn ledger::LedgerClient,
    push: Option<&crate::push::PushClient>,
    llm_api_key: Option<&str>,
    llm_base_url: &str,
    http: &reqwest::Client,
    user_id: &str,
    institution: &str,
    contents: &str,
    csv_profile: Option<CsvProfile>,
    is_broker_positions: bool,
    is_broker_activity: bool,
) -> Result<axum::Json<Value>, ApiError> {
    let parser = Parser::for_file(institution, csv_profile, is_broker_positions, is_broker_activity);
    match parser.parse(contents) {
        ParseResult::Transactions(meta, txns) => {
            let mut cache = HashMap::new();
            let ledger_account_id = upsert_account(
                db,
                ledger,
                &mut cache,
                institution,
                &meta.account_id,
                &meta.account_id,
                &meta.account_type,
                "USD",
            )
            .await?;

            let categorized = categorize::categorize(db, llm_api_key, llm_base_url, http, &txns).await;
            let anomalies = categorize::detect_anomalies(db, &txns).await;
            let summary = upsert_transactions(db, ledger, institution, &ledger_account_id, &txns).await;

            for description in &anomalies {
                let event = AlertEvent {
                    event_type: "anomaly".to_string(),
                    user_id: Some(user_id.to_string()),
                    institution: Some(institution.to_string()),
                    description: Some(description.clone()),
                    ..Default::default()
                };
                alerts::evaluate_event(db, push, &event).await.ok();
            }

            Ok(data(json!({
                "added": summary.added,
                "skipped": summary.skipped,
                "categorized": categorized.len(),
                "anomalies": anomalies,
            })))
        }
        ParseResult::Positions(positions) => Ok(data(json!({ "positions": positions.len() }))),
    }
}

fn parse_csv_profile(text: &str) -> Result<CsvProfile, ApiError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ApiError::BadRequest("csvProfile must be valid json".into()))?;
    Ok(CsvProfile {
        date_column: value.get("dateColumn").and_then(Value::as_str).unwrap_or("Date").to_string(),
        amount_column: value.get("amountColumn").and_then(Value::as_str).unwrap_or("Amount").to_string(),
        description_column: value.get("descriptionColumn").and_then(Value::as_str).unwrap_or("Description").to_string(),
        credit_column: value.get("creditColumn").and_then(Value::as_str).map(str::to_string),
        debit_column: value.get("debitColumn").and_then(Value::as_str).map(str::to_string),
        invert_amount: value.get("invertAmount").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn sanitize_filename(name: &str) -> String {
    name.chars().map(|c| if matches!(c, '\\' | '/' | ':' | '\0') { '_' } else { c }).collect()
}
