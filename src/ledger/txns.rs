use chrono::NaiveDate;
use rusqlite::{OptionalExtension, params};

use crate::parsers::RawTransaction;
use crate::storage::Db;

use super::{CreateTransactionRequest, LedgerClient};

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct UpsertSummary {
    pub added: u32,
    pub skipped: u32,
}

/// Push a batch of raw transactions into the external ledger, suppressing
/// duplicates via the `ImportedTxnKey` table. Never returns an error — every
/// failure mode degrades to a skip.
pub async fn upsert_transactions(
    db: &Db,
    ledger: &dyn LedgerClient,
    institution: &str,
    ledger_account_id: &str,
    raw_txns: &[RawTransaction],
) -> UpsertSummary {
    let mut summary = UpsertSummary::default();

    for raw in raw_txns {
        let external_id = raw.id.clone().unwrap_or_else(|| {
            format!("{institution}-{}-{}-{}", raw.date, raw.name, raw.amount)
        });

        if already_imported(db, &external_id, institution).await {
            summary.skipped += 1;
            continue;
        }

        let amount = raw.amount;
        let (source, destination) = if amount < 0.0 {
            (ledger_account_id.to_string(), raw.name.clone())
        } else {
            (raw.name.clone(), ledger_account_id.to_string())
        };

        let req = CreateTransactionRequest {
            amount: format!("{:.2}", amount.abs()),
            source,
            destination,
            description: raw.name.clone(),
            date: normalize_date(&raw.date),
        };

        match ledger.create_transaction(req).await {
            Ok(ledger_transaction_id) => {
                mark_imported(db, &external_id, institution, &ledger_transaction_id).await;
                summary.added += 1;
            }
            Err(err) => {
                if err.to_string().to_lowercase().contains("duplicate") {
                    summary.skipped += 1;
                } else {
                    eprintln!("[ledger] create_transaction failed for {institution}/{external_id}: {err}");
                    summary.skipped += 1;
                }
            }
        }
    }

    summary
}

async fn already_imported(db: &Db, external_id: &str, institution: &str) -> bool {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT 1 FROM imported_txn_keys WHERE external_id = ?1 AND institution = ?2",
        params![external_id, institution],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .ok()
    .flatten()
    .is_some()
}

async fn mark_imported(db: &Db, external_id: &str, institution: &str, ledger_transaction_id: &str) {
    let conn = db.lock().await;
    let _ = conn.execute(
        "INSERT OR IGNORE INTO imported_txn_keys (external_id, institution, ledger_transaction_id) VALUES (?1, ?2, ?3)",
        params![external_id, institution, ledger_transaction_id],
    );
}

/// Accept `YYYYMMDD`, `MM/DD/YYYY`, or ISO `YYYY-MM-DD`; fall back to today.
fn normalize_date(raw: &str) -> String {
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return d.format("%Y-%m-%d").to_string();
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return d.format("%Y-%m-%d").to_string();
    }
    if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedgerClient;
    use crate::storage;

    fn txn(id: Option<&str>, amount: f64) -> RawTransaction {
        RawTransaction {
            id: id.map(str::to_string),
            date: "2026-01-10".to_string(),
            name: "AMAZON MARKETPLACE".to_string(),
            amount,
            kind: None,
            memo: None,
        }
    }

    #[tokio::test]
    async fn adds_new_transactions_and_marks_them_imported() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();

        let summary = upsert_transactions(&db, &ledger, "chase", "ledger-acct-1", &[txn(Some("t1"), -45.99)]).await;

        assert_eq!(summary.added, 1);
        assert_eq!(summary.skipped, 0);
        assert!(already_imported(&db, "t1", "chase").await);
    }

    #[tokio::test]
    async fn duplicate_external_id_is_skipped_without_calling_ledger() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();

        upsert_transactions(&db, &ledger, "chase", "ledger-acct-1", &[txn(Some("t1"), -10.0)]).await;
        let summary = upsert_transactions(&db, &ledger, "chase", "ledger-acct-1", &[txn(Some("t1"), -10.0)]).await;

        assert_eq!(summary.added, 0);
        assert_eq!(summary.skipped, 1);
        assert_eq!(ledger.transaction_count(), 1);
    }

    #[tokio::test]
    async fn missing_id_synthesizes_one_from_institution_date_name_amount() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();

        let summary = upsert_transactions(&db, &ledger, "chase", "ledger-acct-1", &[txn(None, -45.99)]).await;
        assert_eq!(summary.added, 1);
        assert!(already_imported(&db, "chase-2026-01-10-AMAZON MARKETPLACE--45.99", "chase").await);
    }

    #[tokio::test]
    async fn ledger_duplicate_error_counts_as_skip_not_failure() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();
        // seed the fake's internal dedup so create_transaction returns a "duplicate" error
        let _ = ledger.create_transaction(CreateTransactionRequest {
            amount: "45.99".into(),
            source: "ledger-acct-1".into(),
            destination: "AMAZON MARKETPLACE".into(),
            description: "AMAZON MARKETPLACE".into(),
            date: "2026-01-10".into(),
        }).await;

        let summary = upsert_transactions(&db, &ledger, "chase", "ledger-acct-1", &[txn(Some("t9"), -45.99)]).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.added, 0);
    }
}
