pub mod account;
pub mod fake;
pub mod http;
pub mod txns;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
    pub currency: String,
    #[serde(default)]
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTransactionRequest {
    pub amount: String,
    pub source: String,
    pub destination: String,
    pub description: String,
    pub date: String,
}

/// Client for the external double-entry ledger: one trait, a live HTTP
/// implementation, and a test fake.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>>;
    async fn create_account(&self, name: &str, account_type: &str, currency: &str) -> Result<String>;
    async fn create_transaction(&self, req: CreateTransactionRequest) -> Result<String>;
    async fn update_account_balance(&self, ledger_account_id: &str, balance: f64, date: &str) -> Result<()>;
}

/// `credit` source accounts map to ledger liabilities; everything else is an asset.
pub fn ledger_account_type(source_account_type: &str) -> &'static str {
    if source_account_type.eq_ignore_ascii_case("credit") {
        "liabilities"
    } else {
        "asset"
    }
}
