use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::push::{self, PushClient};
use crate::storage::Db;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: Option<String>,
    pub institution: Option<String>,
    pub account_name: Option<String>,
    pub amount: Option<f64>,
    pub balance: Option<f64>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

struct RuleRow {
    user_id: String,
    threshold: Option<f64>,
    severity: String,
    notify_push: bool,
}

#[derive(Debug, Clone, Serialize)]
struct AlertPayload {
    user_id: String,
    rule_type: String,
    severity: String,
    title: String,
    message: String,
    metadata: Option<serde_json::Value>,
}

/// Evaluate an event against every enabled rule of its type. For
/// each matching rule whose predicate fires, writes an `AlertHistory` row and
/// best-effort pushes. Returns the number of alerts fired.
pub async fn evaluate_event(db: &Db, push: Option<&PushClient>, event: &AlertEvent) -> Result<u32> {
    let rules = load_matching_rules(db, &event.event_type, event.user_id.as_deref()).await?;
    let mut fired = 0;

    for rule in rules {
        let Some((title, message, severity)) = evaluate_predicate(event, &rule) else {
            continue;
        };

        let payload = AlertPayload {
            user_id: rule.user_id.clone(),
            rule_type: event.event_type.clone(),
            severity,
            title,
            message,
            metadata: event.metadata.clone(),
        };

        create_alert(db, push, &payload, rule.notify_push).await;
        fired += 1;
    }

    Ok(fired)
}

/// `(title, message, severity)` if the rule's predicate fires, else `None`.
/// Boundary rules are strict: `<` for low_balance, `>` for large_transaction
/// and anomaly multiples — threshold == value never triggers.
fn evaluate_predicate(event: &AlertEvent, rule: &RuleRow) -> Option<(String, String, String)> {
    match event.event_type.as_str() {
        "low_balance" => {
            let balance = event.balance?;
            let threshold = rule.threshold?;
            if balance < threshold {
                let account = event.account_name.as_deref().unwrap_or("Account");
                Some((
                    "⚠️ Low Balance Alert".to_string(),
                    format!("{account}: ${balance:.2} (below ${threshold})"),
                    "high".to_string(),
                ))
            } else {
                None
            }
        }
        "large_transaction" => {
            let amount = event.amount?;
            let threshold = rule.threshold?;
            if amount.abs() > threshold {
                let description = event.description.as_deref().unwrap_or("");
                Some((
                    "💸 Large Transaction".to_string(),
                    format!("${:.2} — {description}", amount.abs()),
                    "medium".to_string(),
                ))
            } else {
                None
            }
        }
        "sync_failure" => {
            let institution = event.institution.as_deref().unwrap_or("Unknown");
            let description = event.description.as_deref().unwrap_or("");
            Some(("🔴 Sync Failed".to_string(), format!("{institution}: {description}"), "critical".to_string()))
        }
        "new_subscription" => {
            let description = event.description.as_deref().unwrap_or("");
            let amount = event.amount.map(|a| format!("{a:.2}")).unwrap_or_else(|| "?".to_string());
            Some((
                "🔔 New Subscription Detected".to_string(),
                format!("{description} — ${amount}/mo"),
                rule.severity.clone(),
            ))
        }
        "asset_value_change" => {
            Some(("🏠 Property Value Update".to_string(), event.description.clone().unwrap_or_default(), rule.severity.clone()))
        }
        "net_worth_milestone" => {
            Some(("🎯 Net Worth Milestone!".to_string(), event.description.clone().unwrap_or_default(), rule.severity.clone()))
        }
        "anomaly" => {
            Some(("🚨 Unusual Transaction".to_string(), event.description.clone().unwrap_or_default(), rule.severity.clone()))
        }
        _ => None,
    }
}

async fn load_matching_rules(db: &Db, rule_type: &str, event_user_id: Option<&str>) -> Result<Vec<RuleRow>> {
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT user_id, threshold, severity, notify_push FROM alert_rules \
         WHERE rule_type = ?1 AND enabled = 1 AND (?2 IS NULL OR user_id = ?2)",
    )?;
    let rows = stmt
        .query_map(params![rule_type, event_user_id], |row| {
            Ok(RuleRow {
                user_id: row.get(0)?,
                threshold: row.get(1)?,
                severity: row.get(2)?,
                notify_push: row.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Writes one `AlertHistory` row then, if `send_push`, best-effort POSTs to
/// the push transport. Both paths are independent — the push is attempted
/// even if the DB write fails.
async fn create_alert(db: &Db, push: Option<&PushClient>, payload: &AlertPayload, send_push: bool) {
    let conn = db.lock().await;
    let write_result = conn.execute(
        "INSERT INTO alert_history (id, user_id, rule_type, severity, title, message, metadata_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::new_v4().to_string(),
            payload.user_id,
            payload.rule_type,
            payload.severity,
            payload.title,
            payload.message,
            payload.metadata.as_ref().map(|m| m.to_string()),
        ],
    );
    drop(conn);

    if let Err(err) = write_result {
        eprintln!("[alerts] failed to write alert_history for {}: {err}", payload.user_id);
    }

    if send_push {
        if let Some(client) = push {
            let priority = push::priority_for_severity(&payload.severity);
            if let Err(err) = client.send(&payload.title, &payload.message, priority, &[&payload.rule_type]).await {
                eprintln!("[alerts] push delivery failed for {}: {err}", payload.user_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    async fn seed_rule(db: &Db, rule_type: &str, threshold: Option<f64>, severity: &str) {
        let conn = db.lock().await;
        conn.execute("INSERT OR IGNORE INTO users (id, email, password_hash) VALUES ('u1', 'a@b.com', 'x')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO alert_rules (id, user_id, rule_type, threshold, severity) VALUES (?1, 'u1', ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), rule_type, threshold, severity],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn low_balance_below_threshold_fires() {
        let db = storage::open_in_memory().unwrap();
        seed_rule(&db, "low_balance", Some(100.0), "high").await;

        let event = AlertEvent {
            event_type: "low_balance".into(),
            user_id: Some("u1".into()),
            account_name: Some("Checking".into()),
            balance: Some(50.0),
            ..Default::default()
        };
        let fired = evaluate_event(&db, None, &event).await.unwrap();
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn low_balance_equal_to_threshold_does_not_fire() {
        let db = storage::open_in_memory().unwrap();
        seed_rule(&db, "low_balance", Some(100.0), "high").await;

        let event =
            AlertEvent { event_type: "low_balance".into(), user_id: Some("u1".into()), balance: Some(100.0), ..Default::default() };
        let fired = evaluate_event(&db, None, &event).await.unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn large_transaction_uses_absolute_value() {
        let db = storage::open_in_memory().unwrap();
        seed_rule(&db, "large_transaction", Some(500.0), "medium").await;

        let event = AlertEvent {
            event_type: "large_transaction".into(),
            user_id: Some("u1".into()),
            amount: Some(-750.0),
            description: Some("New laptop".into()),
            ..Default::default()
        };
        let fired = evaluate_event(&db, None, &event).await.unwrap();
        assert_eq!(fired, 1);

        let conn = db.lock().await;
        let message: String =
            conn.query_row("SELECT message FROM alert_history LIMIT 1", [], |r| r.get(0)).unwrap();
        assert!(message.contains("750.00"));
    }

    #[tokio::test]
    async fn sync_failure_always_fires_with_critical_severity() {
        let db = storage::open_in_memory().unwrap();
        seed_rule(&db, "sync_failure", None, "critical").await;

        let event = AlertEvent {
            event_type: "sync_failure".into(),
            user_id: Some("u1".into()),
            institution: Some("chase".into()),
            description: Some("connection timed out".into()),
            ..Default::default()
        };
        evaluate_event(&db, None, &event).await.unwrap();

        let conn = db.lock().await;
        let severity: String = conn.query_row("SELECT severity FROM alert_history LIMIT 1", [], |r| r.get(0)).unwrap();
        assert_eq!(severity, "critical");
    }

    #[test]
    fn priority_follows_severity_ladder() {
        assert_eq!(push::priority_for_severity("critical"), "max");
        assert_eq!(push::priority_for_severity("high"), "high");
        assert_eq!(push::priority_for_severity("medium"), "default");
    }
}
