use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::amortization::{self, AmortizationInput};
use crate::ledger::LedgerClient;
use crate::storage::Db;

/// Categories counted as illiquid for forecasting's liquid/illiquid split —
/// kept here alongside the rest of the manual-asset category enumeration.
pub const ILLIQUID_CATEGORIES: &[&str] = &["real_estate", "vehicle", "note_receivable", "note_payable", "business"];

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResult {
    pub total_assets: f64,
    pub total_liabilities: f64,
    pub net_worth: f64,
    pub milestone_crossed: Option<f64>,
}

struct ManualAssetRow {
    id: String,
    asset_type: String,
    current_value: f64,
    principal: Option<f64>,
    annual_rate: Option<f64>,
    start_date: Option<String>,
    term_months: Option<i64>,
}

/// Compute and persist today's net-worth snapshot for one user. Never raises — all failures are logged and swallowed by the caller's
/// background-task wrapper; this function surfaces errors so tests can
/// assert on them, and callers in scheduled contexts are expected to log
/// and discard.
pub async fn compute_snapshot(db: &Db, ledger: &dyn LedgerClient, user_id: &str) -> Result<SnapshotResult> {
    let accounts = ledger.list_accounts().await.unwrap_or_default();

    let mut total_assets = 0.0;
    let mut total_liabilities = 0.0;
    let mut account_breakdown = Vec::new();

    for account in &accounts {
        if account.account_type == "liabilities" || account.account_type == "expense" {
            total_liabilities += account.balance.abs();
        } else {
            total_assets += account.balance;
        }
        account_breakdown.push(json!({
            "id": account.id,
            "name": account.name,
            "type": account.account_type,
            "balance": account.balance,
        }));
    }

    let manual_assets = load_manual_assets(db, user_id).await?;
    let mut manual_breakdown = Vec::new();
    let mut illiquid_total = 0.0;

    for asset in manual_assets {
        let value = if matches!(asset.asset_type.as_str(), "note_receivable" | "note_payable") {
            recompute_note_balance(db, &asset).await?.unwrap_or(asset.current_value)
        } else {
            asset.current_value
        };

        if ILLIQUID_CATEGORIES.contains(&asset.asset_type.as_str()) {
            illiquid_total += value;
        }

        if asset.asset_type == "note_payable" {
            total_liabilities += value;
        } else {
            total_assets += value;
        }

        manual_breakdown.push(json!({ "id": asset.id, "type": asset.asset_type, "value": value }));
    }

    let net_worth = total_assets - total_liabilities;
    let monthly_expenses = monthly_expenses(db, user_id).await.unwrap_or(0.0);

    let breakdown = json!({
        "accounts": account_breakdown,
        "manualAssets": manual_breakdown,
        "illiquidTotal": illiquid_total,
        "monthlyExpenses": monthly_expenses,
    });

    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let previous = previous_net_worth(db, user_id, &today).await?;

    insert_snapshot(db, user_id, &today, total_assets, total_liabilities, net_worth, &breakdown).await?;

    let milestone_crossed = milestone_check(previous, net_worth);

    Ok(SnapshotResult { total_assets, total_liabilities, net_worth, milestone_crossed })
}

/// `milestone = floor(netWorth / 50_000) * 50_000`; fires when the previous
/// snapshot was below the milestone and the new one reaches or passes it.
/// The `milestone > 0.0` guard is a deliberate narrowing (see DESIGN.md) so a
/// brand-new user's first snapshot never fires a vacuous "crossed $0" event.
fn milestone_check(previous: Option<f64>, net_worth: f64) -> Option<f64> {
    let milestone = (net_worth / 50_000.0).floor() * 50_000.0;
    let prev = previous.unwrap_or(f64::MIN);
    if prev < milestone && milestone <= net_worth && milestone > 0.0 {
        Some(milestone)
    } else {
        None
    }
}

async fn load_manual_assets(db: &Db, user_id: &str) -> Result<Vec<ManualAssetRow>> {
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, asset_type, current_value, principal, annual_rate, start_date, term_months \
         FROM manual_assets WHERE user_id = ?1 AND active = 1",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok(ManualAssetRow {
                id: row.get(0)?,
                asset_type: row.get(1)?,
                current_value: row.get(2)?,
                principal: row.get(3)?,
                annual_rate: row.get(4)?,
                start_date: row.get(5)?,
                term_months: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Recompute a note's current balance via the amortization engine and
/// persist it back. Returns `None` if the note's
/// schedule is incomplete (missing principal/rate/start/term) — the caller
/// then falls back to the stored `current_value`.
async fn recompute_note_balance(db: &Db, asset: &ManualAssetRow) -> Result<Option<f64>> {
    let (Some(principal), Some(annual_rate), Some(start_date), Some(term_months)) =
        (asset.principal, asset.annual_rate, asset.start_date.as_deref(), asset.term_months)
    else {
        return Ok(None);
    };

    let Ok(start) = NaiveDate::parse_from_str(start_date, "%Y-%m-%d") else {
        return Ok(None);
    };

    let result = amortization::amortize(&AmortizationInput {
        principal,
        annual_rate_percent: annual_rate,
        term_months: term_months as u32,
        start_date: start,
        payments_made: None,
        include_schedule: false,
    });

    let conn = db.lock().await;
    conn.execute(
        "UPDATE manual_assets SET current_value = ?1 WHERE id = ?2",
        params![result.current_balance, asset.id],
    )?;

    Ok(Some(result.current_balance))
}

async fn monthly_expenses(db: &Db, user_id: &str) -> Result<f64> {
    let conn = db.lock().await;
    let value: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM source_transactions \
         WHERE user_id = ?1 AND amount > 0 AND txn_date >= date('now', '-30 days')",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(value)
}

async fn previous_net_worth(db: &Db, user_id: &str, today: &str) -> Result<Option<f64>> {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT net_worth FROM net_worth_snapshots WHERE user_id = ?1 AND snapshot_date < ?2 \
         ORDER BY snapshot_date DESC LIMIT 1",
        params![user_id, today],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

async fn insert_snapshot(
    db: &Db,
    user_id: &str,
    date: &str,
    total_assets: f64,
    total_liabilities: f64,
    net_worth: f64,
    breakdown: &serde_json::Value,
) -> Result<()> {
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO net_worth_snapshots (id, user_id, snapshot_date, total_assets, total_liabilities, net_worth, breakdown_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(user_id, snapshot_date) DO UPDATE SET \
            total_assets = excluded.total_assets, total_liabilities = excluded.total_liabilities, \
            net_worth = excluded.net_worth, breakdown_json = excluded.breakdown_json",
        params![Uuid::new_v4().to_string(), user_id, date, total_assets, total_liabilities, net_worth, breakdown.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedgerClient;
    use crate::storage;

    async fn seed_user(db: &Db) {
        let conn = db.lock().await;
        conn.execute("INSERT INTO users (id, email, password_hash) VALUES ('u1', 'a@b.com', 'x')", [])
            .unwrap();
    }

    #[tokio::test]
    async fn sums_assets_and_liabilities_from_the_ledger() {
        let db = storage::open_in_memory().unwrap();
        seed_user(&db).await;
        let ledger = FakeLedgerClient::new();
        ledger.seed_account_with_balance("a1", "[chase] Checking", "asset", 5000.0);
        ledger.seed_account_with_balance("a2", "[amex] Card", "liabilities", -1200.0);

        let result = compute_snapshot(&db, &ledger, "u1").await.unwrap();

        assert_eq!(result.total_assets, 5000.0);
        assert_eq!(result.total_liabilities, 1200.0);
        assert_eq!(result.net_worth, 3800.0);
    }

    #[tokio::test]
    async fn overwrites_same_day_snapshot_on_conflict() {
        let db = storage::open_in_memory().unwrap();
        seed_user(&db).await;
        let ledger = FakeLedgerClient::new();
        ledger.seed_account_with_balance("a1", "[chase] Checking", "asset", 1000.0);

        compute_snapshot(&db, &ledger, "u1").await.unwrap();
        ledger.seed_account_with_balance("a2", "[chase] Savings", "asset", 500.0);
        compute_snapshot(&db, &ledger, "u1").await.unwrap();

        let conn = db.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM net_worth_snapshots WHERE user_id = 'u1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn note_payable_balance_is_recomputed_via_amortization() {
        let db = storage::open_in_memory().unwrap();
        seed_user(&db).await;
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO manual_assets (id, user_id, asset_type, current_value, principal, annual_rate, start_date, term_months) \
                 VALUES ('m1', 'u1', 'note_payable', 300000.0, 300000.0, 7.0, '2020-01-01', 360)",
                [],
            )
            .unwrap();
        }
        let ledger = FakeLedgerClient::new();

        let result = compute_snapshot(&db, &ledger, "u1").await.unwrap();
        assert!(result.total_liabilities > 0.0);
        assert!(result.total_liabilities <= 300_000.0);
    }

    #[test]
    fn milestone_fires_when_crossing_a_fifty_k_boundary() {
        assert_eq!(milestone_check(Some(45_000.0), 51_000.0), Some(50_000.0));
        assert_eq!(milestone_check(Some(51_000.0), 52_000.0), None);
        assert_eq!(milestone_check(None, 10_000.0), None);
    }
}
