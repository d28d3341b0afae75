use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use uuid::Uuid;

use super::{CreateTransactionRequest, LedgerAccount, LedgerClient};

/// In-memory `LedgerClient` for tests — a fake implementation of the trait
/// rather than a mocked HTTP layer.
#[derive(Default)]
pub struct FakeLedgerClient {
    accounts: Mutex<Vec<LedgerAccount>>,
    seen_descriptions: Mutex<Vec<String>>,
}

impl FakeLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_account(&self, id: &str, name: &str, account_type: &str) {
        self.seed_account_with_balance(id, name, account_type, 0.0);
    }

    pub fn seed_account_with_balance(&self, id: &str, name: &str, account_type: &str, balance: f64) {
        self.accounts.lock().unwrap().push(LedgerAccount {
            id: id.to_string(),
            name: name.to_string(),
            account_type: account_type.to_string(),
            currency: "USD".to_string(),
            balance,
        });
    }

    pub fn transaction_count(&self) -> usize {
        self.seen_descriptions.lock().unwrap().len()
    }
}

#[async_trait]
impl LedgerClient for FakeLedgerClient {
    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>> {
        Ok(self.accounts.lock().unwrap().clone())
    }

    async fn create_account(&self, name: &str, account_type: &str, currency: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.accounts.lock().unwrap().push(LedgerAccount {
            id: id.clone(),
            name: name.to_string(),
            account_type: account_type.to_string(),
            currency: currency.to_string(),
            balance: 0.0,
        });
        Ok(id)
    }

    async fn create_transaction(&self, req: CreateTransactionRequest) -> Result<String> {
        let mut seen = self.seen_descriptions.lock().unwrap();
        if seen.contains(&req.description) {
            bail!("duplicate transaction: {}", req.description);
        }
        seen.push(req.description);
        Ok(Uuid::new_v4().to_string())
    }

    async fn update_account_balance(&self, _ledger_account_id: &str, _balance: f64, _date: &str) -> Result<()> {
        Ok(())
    }
}
