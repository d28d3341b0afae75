use serde_json::{Value, json};

use super::super::error::ApiError;
use super::data;

/// Stripe billing integration is an explicit non-goal; the route surface
/// still exists so a frontend can render plan tiers, but `plans` is a
/// static table and `webhook` only acknowledges (see DESIGN.md).
pub async fn plans() -> axum::Json<Value> {
    data(json!([
        { "id": "free", "name": "Free", "priceCents": 0 },
        { "id": "pro", "name": "Pro", "priceCents": 900 },
        { "id": "lifetime", "name": "Lifetime", "priceCents": 19900 },
    ]))
}

pub async fn webhook(axum::Json(payload): axum::Json<Value>) -> Result<axum::Json<Value>, ApiError> {
    eprintln!("[billing webhook] {payload}");
    Ok(data(json!({ "received": true })))
}
