pub mod fake;
pub mod http;
pub mod sync;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorTransaction {
    pub transaction_id: String,
    pub external_account_id: String,
    pub amount: f64,
    pub name: String,
    pub merchant: Option<String>,
    pub categories: Vec<String>,
    pub pending: bool,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorAccountBalance {
    pub external_account_id: String,
    pub current_balance: f64,
    pub available_balance: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct SyncPage {
    pub added: Vec<AggregatorTransaction>,
    pub modified: Vec<AggregatorTransaction>,
    pub removed: Vec<String>,
    pub next_cursor: String,
    pub has_more: bool,
}

/// Client for the hosted multi-institution aggregator (Plaid-shaped, spec
/// §4.4). Same adapter pattern as `ledger::LedgerClient`: one trait, an HTTP
/// implementation, and a test fake.
#[async_trait]
pub trait AggregatorClient: Send + Sync {
    async fn sync_transactions(&self, access_token: &str, cursor: Option<&str>) -> Result<SyncPage>;
    async fn get_balances(&self, access_token: &str) -> Result<Vec<AggregatorAccountBalance>>;
}
