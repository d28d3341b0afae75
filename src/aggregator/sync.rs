use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde_json::json;

use crate::auth;
use crate::ledger::{self, LedgerClient};
use crate::parsers::RawTransaction;
use crate::storage::{self, Db};

use super::{AggregatorClient, AggregatorTransaction};

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SyncOutcome {
    pub added: u32,
    pub modified: u32,
    pub removed: u32,
    pub bridged_added: u32,
    pub bridged_skipped: u32,
}

struct LinkRow {
    user_id: String,
    institution_name: String,
    credential_enc: Option<String>,
    sync_cursor: Option<String>,
}

/// Run one full delta-sync cycle for an institution link: page through `transactions/sync` until exhausted, reconcile the local
/// mirror in one DB transaction, then best-effort bridge the delta to the
/// ledger. Upstream transient failures here are the caller's responsibility
/// to log and swallow — this function raises on them.
pub async fn delta_sync(
    db: &Db,
    aggregator: &dyn AggregatorClient,
    ledger: &dyn LedgerClient,
    ledger_cache: &mut HashMap<String, String>,
    encryption_key: &[u8; 32],
    link_id: &str,
) -> Result<SyncOutcome> {
    let link = load_link(db, link_id).await.context("loading institution link")?;
    let access_token = match &link.credential_enc {
        Some(enc) => auth::decrypt_credential(enc, encryption_key)?,
        None => anyhow::bail!("institution link {link_id} has no stored credential"),
    };

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut removed = Vec::new();
    let mut cursor = link.sync_cursor.clone();

    loop {
        let page = aggregator.sync_transactions(&access_token, cursor.as_deref()).await?;
        added.extend(page.added);
        modified.extend(page.modified);
        removed.extend(page.removed);
        cursor = Some(page.next_cursor);
        if !page.has_more {
            break;
        }
    }

    let next_cursor = cursor.unwrap_or_default();
    let outcome_counts = (added.len() as u32, modified.len() as u32, removed.len() as u32);

    {
        let user_id = link.user_id.clone();
        let link_id_owned = link_id.to_string();
        let added = added.clone();
        let modified = modified.clone();
        let removed = removed.clone();
        let next_cursor = next_cursor.clone();

        storage::transaction(db, move |conn| {
            for txn in added.iter().chain(modified.iter()) {
                upsert_mirror(conn, &link_id_owned, &user_id, txn)?;
            }
            for transaction_id in &removed {
                conn.execute(
                    "DELETE FROM source_transactions WHERE transaction_id = ?1 AND user_id = ?2",
                    params![transaction_id, user_id],
                )?;
            }
            conn.execute(
                "UPDATE institution_links SET sync_cursor = ?1, status = 'good', last_error_code = NULL, \
                 last_error_message = NULL, last_synced_at = unixepoch() WHERE id = ?2",
                params![next_cursor, link_id_owned],
            )?;
            Ok(())
        })
        .await?;
    }

    let mut bridged_added = 0u32;
    let mut bridged_skipped = 0u32;

    for (external_account_id, txns) in group_by_account(&added, &modified) {
        match bridge_to_ledger(db, ledger, ledger_cache, &link, &external_account_id, &txns).await {
            Ok(summary) => {
                bridged_added += summary.added;
                bridged_skipped += summary.skipped;
            }
            Err(err) => {
                eprintln!("[aggregator] ledger bridge failed for link {link_id}/{external_account_id}: {err}");
            }
        }
    }

    Ok(SyncOutcome {
        added: outcome_counts.0,
        modified: outcome_counts.1,
        removed: outcome_counts.2,
        bridged_added,
        bridged_skipped,
    })
}

/// Pull current balances and push them to both the local mirror and the
/// ledger, best-effort on the ledger side.
pub async fn refresh_balances(
    db: &Db,
    aggregator: &dyn AggregatorClient,
    ledger: &dyn LedgerClient,
    ledger_cache: &mut HashMap<String, String>,
    encryption_key: &[u8; 32],
    link_id: &str,
) -> Result<u32> {
    let link = load_link(db, link_id).await?;
    let access_token = match &link.credential_enc {
        Some(enc) => auth::decrypt_credential(enc, encryption_key)?,
        None => anyhow::bail!("institution link {link_id} has no stored credential"),
    };

    let balances = aggregator.get_balances(&access_token).await?;
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();

    for balance in &balances {
        let conn = db.lock().await;
        conn.execute(
            "UPDATE source_accounts SET current_balance = ?1, available_balance = ?2 \
             WHERE link_id = ?3 AND external_account_id = ?4",
            params![
                balance.current_balance,
                balance.available_balance,
                link_id,
                balance.external_account_id
            ],
        )?;
        drop(conn);

        let cache_key = format!("{}:{}", link.institution_name, balance.external_account_id);
        if let Some(ledger_account_id) = ledger_cache.get(&cache_key).cloned() {
            let _ = ledger
                .update_account_balance(&ledger_account_id, balance.current_balance, &today)
                .await;
        }
    }

    Ok(balances.len() as u32)
}

async fn load_link(db: &Db, link_id: &str) -> Result<LinkRow> {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT user_id, institution_name, credential_enc, sync_cursor FROM institution_links WHERE id = ?1",
        params![link_id],
        |row| {
            Ok(LinkRow {
                user_id: row.get(0)?,
                institution_name: row.get(1)?,
                credential_enc: row.get(2)?,
                sync_cursor: row.get(3)?,
            })
        },
    )
    .context("institution link not found")
}

fn upsert_mirror(conn: &Connection, link_id: &str, user_id: &str, txn: &AggregatorTransaction) -> Result<()> {
    conn.execute(
        "INSERT INTO source_transactions \
            (transaction_id, link_id, user_id, external_account_id, amount, name, merchant, categories_json, pending, txn_date) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(transaction_id) DO UPDATE SET \
            amount = excluded.amount, name = excluded.name, merchant = excluded.merchant, \
            categories_json = excluded.categories_json, pending = excluded.pending, txn_date = excluded.txn_date",
        params![
            txn.transaction_id,
            link_id,
            user_id,
            txn.external_account_id,
            txn.amount,
            txn.name,
            txn.merchant,
            json!(txn.categories).to_string(),
            txn.pending as i32,
            txn.date,
        ],
    )?;
    Ok(())
}

fn group_by_account(
    added: &[AggregatorTransaction],
    modified: &[AggregatorTransaction],
) -> Vec<(String, Vec<AggregatorTransaction>)> {
    let mut groups: HashMap<String, Vec<AggregatorTransaction>> = HashMap::new();
    for txn in added.iter().chain(modified.iter()) {
        groups.entry(txn.external_account_id.clone()).or_default().push(txn.clone());
    }
    groups.into_iter().collect()
}

async fn bridge_to_ledger(
    db: &Db,
    ledger: &dyn LedgerClient,
    ledger_cache: &mut HashMap<String, String>,
    link: &LinkRow,
    external_account_id: &str,
    txns: &[AggregatorTransaction],
) -> Result<ledger::txns::UpsertSummary> {
    let (name, account_type, currency) = source_account_meta(db, external_account_id).await;

    let ledger_account_id = ledger::account::upsert_account(
        db,
        ledger,
        ledger_cache,
        &link.institution_name,
        external_account_id,
        &name,
        &account_type,
        &currency,
    )
    .await?;

    let raw_txns: Vec<RawTransaction> = txns
        .iter()
        .map(|t| RawTransaction {
            id: Some(t.transaction_id.clone()),
            date: t.date.clone(),
            name: t.name.clone(),
            amount: t.amount,
            kind: None,
            memo: t.merchant.clone(),
        })
        .collect();

    Ok(ledger::txns::upsert_transactions(db, ledger, &link.institution_name, &ledger_account_id, &raw_txns).await)
}

async fn source_account_meta(db: &Db, external_account_id: &str) -> (String, String, String) {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT name, account_type, currency FROM source_accounts WHERE external_account_id = ?1",
        params![external_account_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .unwrap_or_else(|_| (external_account_id.to_string(), "asset".to_string(), "USD".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::fake::FakeAggregatorClient;
    use crate::ledger::fake::FakeLedgerClient;

    async fn seed_link(db: &Db, key: &[u8; 32]) -> String {
        let credential = auth::encrypt_credential("access-sandbox-token", key).unwrap();
        let conn = db.lock().await;
        conn.execute(
            "INSERT INTO users (id, email, password_hash) VALUES ('u1', 'a@b.com', 'x')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO institution_links (id, user_id, source_kind, credential_enc, institution_name) \
             VALUES ('link1', 'u1', 'aggregator', ?1, 'chase')",
            params![credential],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO source_accounts (id, link_id, user_id, external_account_id, name, account_type) \
             VALUES ('sa1', 'link1', 'u1', 'acct-1', 'Checking', 'depository')",
            [],
        )
        .unwrap();
        drop(conn);
        "link1".to_string()
    }

    #[tokio::test]
    async fn delta_sync_reconciles_added_and_bridges_to_ledger() {
        let db = storage::open_in_memory().unwrap();
        let key = [7u8; 32];
        let link_id = seed_link(&db, &key).await;

        let aggregator = FakeAggregatorClient::new();
        aggregator.push_page(FakeAggregatorClient::single_page(
            vec![AggregatorTransaction {
                transaction_id: "t1".into(),
                external_account_id: "acct-1".into(),
                amount: -45.99,
                name: "AMAZON".into(),
                merchant: Some("Amazon".into()),
                categories: vec!["shopping".into()],
                pending: false,
                date: "2026-01-10".into(),
            }],
            "cursor-1",
        ));
        let ledger = FakeLedgerClient::new();
        let mut cache = HashMap::new();

        let outcome = delta_sync(&db, &aggregator, &ledger, &mut cache, &key, &link_id).await.unwrap();

        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.bridged_added, 1);
        assert_eq!(ledger.transaction_count(), 1);
    }

    #[tokio::test]
    async fn removed_transactions_are_deleted_from_the_mirror() {
        let db = storage::open_in_memory().unwrap();
        let key = [7u8; 32];
        let link_id = seed_link(&db, &key).await;

        let aggregator = FakeAggregatorClient::new();
        aggregator.push_page(FakeAggregatorClient::single_page(
            vec![AggregatorTransaction {
                transaction_id: "t1".into(),
                external_account_id: "acct-1".into(),
                amount: -10.0,
                name: "X".into(),
                merchant: None,
                categories: vec![],
                pending: false,
                date: "2026-01-01".into(),
            }],
            "cursor-1",
        ));
        let ledger = FakeLedgerClient::new();
        let mut cache = HashMap::new();
        delta_sync(&db, &aggregator, &ledger, &mut cache, &key, &link_id).await.unwrap();

        aggregator.push_page(super::super::SyncPage {
            added: vec![],
            modified: vec![],
            removed: vec!["t1".into()],
            next_cursor: "cursor-2".into(),
            has_more: false,
        });
        let outcome = delta_sync(&db, &aggregator, &ledger, &mut cache, &key, &link_id).await.unwrap();
        assert_eq!(outcome.removed, 1);

        let conn = db.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM source_transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
