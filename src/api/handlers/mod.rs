pub mod alerts;
pub mod assets;
pub mod auth;
pub mod billing;
pub mod forecasting;
pub mod insights;
pub mod networth;
pub mod plaid;
pub mod sync;
pub mod upload;

use axum::Json;
use serde::Serialize;
use serde_json::{Value, json};

/// Wrap a value in the `{"data": ...}` envelope every successful response
/// uses.
pub fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}
