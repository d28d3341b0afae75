use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::storage::Db;

#[derive(Debug, Clone, Serialize)]
pub struct CategoryTotal {
    pub category: String,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyInsights {
    pub year: i32,
    pub month: u32,
    pub total_income: f64,
    pub total_spending: f64,
    pub savings_rate: f64,
    pub by_category: Vec<CategoryTotal>,
    pub emergency_fund_months: Option<f64>,
}

/// Compute and persist one user's insights for `(year, month)`.
/// Always succeeds — a user with no transactions in the month gets an
/// all-zero snapshot rather than an error.
pub async fn generate_monthly(db: &Db, user_id: &str, year: i32, month: u32) -> Result<MonthlyInsights> {
    let (total_income, total_spending, by_category) = category_breakdown(db, user_id, year, month).await?;

    let savings_rate = if total_income > 0.0 { (total_income - total_spending) / total_income } else { 0.0 };

    let emergency_fund_months = emergency_fund_months(db, user_id).await?;

    let insights = MonthlyInsights {
        year,
        month,
        total_income,
        total_spending,
        savings_rate,
        by_category,
        emergency_fund_months,
    };

    persist(db, user_id, &insights).await?;
    Ok(insights)
}

async fn category_breakdown(db: &Db, user_id: &str, year: i32, month: u32) -> Result<(f64, f64, Vec<CategoryTotal>)> {
    let conn = db.lock().await;
    let month_prefix = format!("{year:04}-{month:02}");

    let total_income: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(-amount), 0) FROM source_transactions \
             WHERE user_id = ?1 AND amount < 0 AND txn_date LIKE ?2 || '%'",
            params![user_id, month_prefix],
            |row| row.get(0),
        )
        .unwrap_or(0.0);

    let total_spending: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM source_transactions \
             WHERE user_id = ?1 AND amount > 0 AND txn_date LIKE ?2 || '%'",
            params![user_id, month_prefix],
            |row| row.get(0),
        )
        .unwrap_or(0.0);

    let mut stmt = conn.prepare(
        "SELECT COALESCE(mc.category, 'other') AS category, SUM(st.amount) AS total \
         FROM source_transactions st \
         LEFT JOIN merchant_categories mc ON mc.merchant = st.merchant \
         WHERE st.user_id = ?1 AND st.amount > 0 AND st.txn_date LIKE ?2 || '%' \
         GROUP BY category ORDER BY total DESC",
    )?;
    let by_category = stmt
        .query_map(params![user_id, month_prefix], |row| {
            Ok(CategoryTotal { category: row.get(0)?, total: row.get(1)? })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((total_income, total_spending, by_category))
}

/// Liquid net worth (latest snapshot minus its illiquid total) divided by
/// trailing-3-month average spending. `None` if there's no snapshot yet or
/// spending has been zero — the ratio is meaningless in either case.
async fn emergency_fund_months(db: &Db, user_id: &str) -> Result<Option<f64>> {
    let conn = db.lock().await;
    let latest: Option<(f64, String)> = conn
        .query_row(
            "SELECT net_worth, breakdown_json FROM net_worth_snapshots WHERE user_id = ?1 \
             ORDER BY snapshot_date DESC LIMIT 1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((net_worth, breakdown_json)) = latest else { return Ok(None) };
    let illiquid = serde_json::from_str::<serde_json::Value>(&breakdown_json)
        .ok()
        .and_then(|v| v.get("illiquidTotal").and_then(|v| v.as_f64()))
        .unwrap_or(0.0);
    let liquid_net_worth = (net_worth - illiquid).max(0.0);

    let avg_monthly_spending: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) / 3.0 FROM source_transactions \
         WHERE user_id = ?1 AND amount > 0 AND txn_date >= date('now', '-90 days')",
        params![user_id],
        |row| row.get(0),
    )?;

    if avg_monthly_spending <= 0.0 {
        return Ok(None);
    }
    Ok(Some(liquid_net_worth / avg_monthly_spending))
}

async fn persist(db: &Db, user_id: &str, insights: &MonthlyInsights) -> Result<()> {
    let summary = json!({
        "totalIncome": insights.total_income,
        "totalSpending": insights.total_spending,
        "savingsRate": insights.savings_rate,
        "byCategory": insights.by_category,
        "emergencyFundMonths": insights.emergency_fund_months,
    });

    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO monthly_insights (id, user_id, year, month, summary_json) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(user_id, year, month) DO UPDATE SET summary_json = excluded.summary_json",
        params![Uuid::new_v4().to_string(), user_id, insights.year, insights.month, summary.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    async fn seed_user(db: &Db) {
        let conn = db.lock().await;
        conn.execute("INSERT INTO users (id, email, password_hash) VALUES ('u1', 'a@b.com', 'x')", [])
            .unwrap();
    }

    async fn seed_txn(db: &Db, merchant: &str, amount: f64, date: &str) {
        let conn = db.lock().await;
        conn.execute(
            "INSERT INTO source_transactions (transaction_id, link_id, user_id, external_account_id, amount, name, merchant, txn_date) \
             VALUES (?1, 'l1', 'u1', 'a1', ?2, ?3, ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), amount, merchant, date],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn computes_income_spending_and_savings_rate() {
        let db = storage::open_in_memory().unwrap();
        seed_user(&db).await;
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO institution_links (id, user_id, source_kind, institution_name) VALUES ('l1', 'u1', 'aggregator', 'chase')",
                [],
            )
            .unwrap();
        }
        seed_txn(&db, "Employer", -3000.0, "2026-05-01").await;
        seed_txn(&db, "Rent Co", 1500.0, "2026-05-02").await;
        seed_txn(&db, "Grocery Store", 400.0, "2026-05-03").await;

        let insights = generate_monthly(&db, "u1", 2026, 5).await.unwrap();
        assert_eq!(insights.total_income, 3000.0);
        assert_eq!(insights.total_spending, 1900.0);
        assert!((insights.savings_rate - (3000.0 - 1900.0) / 3000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upserts_the_same_month_snapshot() {
        let db = storage::open_in_memory().unwrap();
        seed_user(&db).await;
        generate_monthly(&db, "u1", 2026, 6).await.unwrap();
        generate_monthly(&db, "u1", 2026, 6).await.unwrap();

        let conn = db.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM monthly_insights WHERE user_id = 'u1'", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
