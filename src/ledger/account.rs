use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{OptionalExtension, params};

use crate::storage::Db;

use super::{LedgerClient, ledger_account_type};

/// Resolve an institution's external account to a ledger account id,
/// creating it on the external ledger if necessary.
///
/// Resolution order: process-local cache → persistent mapping table → list
/// ledger accounts and match display name → create. Only step 4 (create) is
/// allowed to return an error; cache and mapping-table failures are
/// swallowed and the next step is attempted.
pub async fn upsert_account(
    db: &Db,
    ledger: &dyn LedgerClient,
    cache: &mut HashMap<String, String>,
    institution: &str,
    external_id: &str,
    name: &str,
    account_type: &str,
    currency: &str,
) -> Result<String> {
    let cache_key = format!("{institution}:{external_id}");

    if let Some(id) = cache.get(&cache_key) {
        return Ok(id.clone());
    }

    if let Some(id) = lookup_mapping(db, institution, external_id).await {
        cache.insert(cache_key, id.clone());
        return Ok(id);
    }

    let display_name = format!("[{institution}] {name}");
    if let Ok(accounts) = ledger.list_accounts().await {
        if let Some(existing) = accounts.into_iter().find(|a| a.name == display_name) {
            persist_mapping(db, institution, external_id, &existing.id).await.ok();
            cache.insert(cache_key, existing.id.clone());
            return Ok(existing.id);
        }
    }

    let ledger_type = ledger_account_type(account_type);
    let ledger_account_id = ledger.create_account(&display_name, ledger_type, currency).await?;

    persist_mapping(db, institution, external_id, &ledger_account_id).await.ok();
    cache.insert(cache_key, ledger_account_id.clone());
    Ok(ledger_account_id)
}

async fn lookup_mapping(db: &Db, institution: &str, external_id: &str) -> Option<String> {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT ledger_account_id FROM ledger_account_map WHERE institution = ?1 AND external_id = ?2",
        params![institution, external_id],
        |row| row.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

async fn persist_mapping(db: &Db, institution: &str, external_id: &str, ledger_account_id: &str) -> Result<()> {
    let conn = db.lock().await;
    conn.execute(
        "INSERT OR REPLACE INTO ledger_account_map (institution, external_id, ledger_account_id) VALUES (?1, ?2, ?3)",
        params![institution, external_id, ledger_account_id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::fake::FakeLedgerClient;
    use crate::storage;

    #[tokio::test]
    async fn creates_account_on_first_call_and_caches_it() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();
        let mut cache = HashMap::new();

        let id = upsert_account(&db, &ledger, &mut cache, "chase", "acct-1", "Checking", "depository", "USD")
            .await
            .unwrap();

        assert!(cache.contains_key("chase:acct-1"));
        let again = upsert_account(&db, &ledger, &mut cache, "chase", "acct-1", "Checking", "depository", "USD")
            .await
            .unwrap();
        assert_eq!(id, again);
    }

    #[tokio::test]
    async fn credit_accounts_map_to_liabilities() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();
        let mut cache = HashMap::new();

        upsert_account(&db, &ledger, &mut cache, "amex", "card-1", "Platinum", "credit", "USD")
            .await
            .unwrap();

        let accounts = ledger.list_accounts().await.unwrap();
        assert_eq!(accounts[0].account_type, "liabilities");
    }

    #[tokio::test]
    async fn matches_existing_ledger_account_by_display_name() {
        let db = storage::open_in_memory().unwrap();
        let ledger = FakeLedgerClient::new();
        ledger.seed_account("existing-1", "[chase] Checking", "asset");
        let mut cache = HashMap::new();

        let id = upsert_account(&db, &ledger, &mut cache, "chase", "acct-1", "Checking", "depository", "USD")
            .await
            .unwrap();

        assert_eq!(id, "existing-1");
    }
}
