use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::params;
use uuid::Uuid;

use crate::alerts::{self, AlertEvent};
use crate::categorize;
use crate::ledger::LedgerClient;
use crate::ledger::account::upsert_account;
use crate::ledger::txns::upsert_transactions;
use crate::parsers::{AccountMeta, ParseResult, Parser, RawTransaction};
use crate::push::PushClient;
use crate::storage::Db;

const FAILURE_THRESHOLD: u32 = 3;

/// Process-wide `failureCount[institution]`. Lives for the life of the
/// process, not persisted — a restart resets the counter.
#[derive(Default)]
pub struct OfxSyncState {
    failure_count: Mutex<HashMap<String, u32>>,
}

impl OfxSyncState {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_failure(&self, institution: &str) -> u32 {
        let mut counts = self.failure_count.lock().unwrap();
        let count = counts.entry(institution.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn reset(&self, institution: &str) {
        self.failure_count.lock().unwrap().remove(institution);
    }
}

/// Run the OFX sync for every institution in the fixed list. Failures in one
/// institution never abort the rest.
pub async fn sync_all(
    db: &Db,
    ledger: &dyn LedgerClient,
    ledger_cache: &mut HashMap<String, String>,
    downloader: &dyn super::downloader::OfxDownloader,
    push: Option<&PushClient>,
    state: &OfxSyncState,
    institutions: &[String],
) {
    for institution in institutions {
        if let Err(err) = sync_institution(db, ledger, ledger_cache, downloader, push, state, institution).await {
            eprintln!("[ofx] sync failed for {institution}: {err}");
        }
    }
}

async fn sync_institution(
    db: &Db,
    ledger: &dyn LedgerClient,
    ledger_cache: &mut HashMap<String, String>,
    downloader: &dyn super::downloader::OfxDownloader,
    push: Option<&PushClient>,
    state: &OfxSyncState,
    institution: &str,
) -> Result<()> {
    let log_id = open_sync_log(db, institution).await?;

    let files = match downloader.download(institution).await {
        Ok(files) => files,
        Err(err) => {
            let count = state.record_failure(institution);
            if count >= FAILURE_THRESHOLD {
                let event = AlertEvent {
                    event_type: "sync_failure".into(),
                    institution: Some(institution.to_string()),
                    description: Some(err.to_string()),
                    ..Default::default()
                };
                if let Err(alert_err) = alerts::evaluate_event(db, push, &event).await {
                    eprintln!("[ofx] failed to raise sync_failure alert for {institution}: {alert_err}");
                }
            }
            close_sync_log(db, &log_id, "error", 0, Some(&err.to_string())).await?;
            return Ok(());
        }
    };

    state.reset(institution);

    let mut total_added = 0u32;

    for path in &files {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let parser = Parser::for_file(filename, None, false, false);
                match parser.parse(&contents) {
                    ParseResult::Transactions(meta, txns) => {
                        total_added += import_file(db, ledger, ledger_cache, institution, &meta, &txns).await;
                    }
                    ParseResult::Positions(_) => {
                        // Brokerage positions files carry no transactions to import here.
                    }
                }
                mark_done(path);
            }
            Err(err) => {
                eprintln!("[ofx] failed to read {}: {err}", path.display());
            }
        }
    }

    close_sync_log(db, &log_id, "success", total_added, None).await?;
    Ok(())
}

/// UpsertAccount + upsertTransactions for one downloaded file, then run the
/// anomaly check over `rawTxns[0..added]` — a leading-slice approximation
/// rather than tracking exactly which rows were new.
async fn import_file(
    db: &Db,
    ledger: &dyn LedgerClient,
    ledger_cache: &mut HashMap<String, String>,
    institution: &str,
    meta: &AccountMeta,
    txns: &[RawTransaction],
) -> u32 {
    let account_id = match upsert_account(
        db,
        ledger,
        ledger_cache,
        institution,
        &meta.account_id,
        &format!("{institution} {}", meta.account_type),
        &meta.account_type,
        "USD",
    )
    .await
    {
        Ok(id) => id,
        Err(err) => {
            eprintln!("[ofx] upsertAccount failed for {institution}/{}: {err}", meta.account_id);
            return 0;
        }
    };

    let summary = upsert_transactions(db, ledger, institution, &account_id, txns).await;

    let added_slice = &txns[..(summary.added as usize).min(txns.len())];
    for anomaly in categorize::detect_anomalies(db, added_slice).await {
        let event = AlertEvent {
            event_type: "anomaly".into(),
            institution: Some(institution.to_string()),
            description: Some(anomaly),
            ..Default::default()
        };
        let _ = alerts::evaluate_event(db, None, &event).await;
    }

    summary.added
}

fn mark_done(path: &std::path::Path) {
    let mut done = path.to_path_buf();
    let new_name = format!("{}.done", path.file_name().and_then(|n| n.to_str()).unwrap_or("file"));
    done.set_file_name(new_name);
    if let Err(err) = std::fs::rename(path, &done) {
        eprintln!("[ofx] failed to mark {} done: {err}", path.display());
    }
}

async fn open_sync_log(db: &Db, institution: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO sync_log (id, institution, method, status) VALUES (?1, ?2, 'ofx', 'running')",
        params![id, institution],
    )?;
    Ok(id)
}

async fn close_sync_log(db: &Db, log_id: &str, status: &str, transactions_added: u32, error_message: Option<&str>) -> Result<()> {
    let conn = db.lock().await;
    conn.execute(
        "UPDATE sync_log SET status = ?1, transactions_added = ?2, error_message = ?3, completed_at = unixepoch() \
         WHERE id = ?4",
        params![status, transactions_added, error_message, log_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedgerClient;
    use crate::scheduler::downloader::fake::FakeOfxDownloader;
    use crate::storage;

    #[tokio::test]
    async fn third_consecutive_download_failure_raises_sync_failure_alert() {
        let db = storage::open_in_memory().unwrap();
        {
            let conn = db.lock().await;
            conn.execute("INSERT INTO users (id, email, password_hash) VALUES ('u1', 'a@b.com', 'x')", [])
                .unwrap();
            conn.execute(
                "INSERT INTO alert_rules (id, user_id, rule_type, severity) VALUES ('r1', 'u1', 'sync_failure', 'critical')",
                [],
            )
            .unwrap();
        }
        let ledger = FakeLedgerClient::new();
        let downloader = FakeOfxDownloader::new();
        downloader.queue_failure("chase", "timed out");
        let state = OfxSyncState::new();
        let mut cache = HashMap::new();

        sync_institution(&db, &ledger, &mut cache, &downloader, None, &state, "chase").await.unwrap();
        downloader.queue_failure("chase", "timed out");
        sync_institution(&db, &ledger, &mut cache, &downloader, None, &state, "chase").await.unwrap();

        let conn = db.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM alert_history", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0, "should not fire before the third failure");
        drop(conn);

        downloader.queue_failure("chase", "timed out");
        sync_institution(&db, &ledger, &mut cache, &downloader, None, &state, "chase").await.unwrap();

        let conn = db.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM alert_history", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();
        let downloader = FakeOfxDownloader::new();
        let state = OfxSyncState::new();
        let mut cache = HashMap::new();

        downloader.queue_failure("amex", "timed out");
        sync_institution(&db, &ledger, &mut cache, &downloader, None, &state, "amex").await.unwrap();
        downloader.queue_files("amex", vec![]);
        sync_institution(&db, &ledger, &mut cache, &downloader, None, &state, "amex").await.unwrap();

        assert_eq!(state.record_failure("amex"), 1, "count should have reset after the success");
    }
}
