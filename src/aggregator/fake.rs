use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{AggregatorAccountBalance, AggregatorClient, AggregatorTransaction, SyncPage};

/// In-memory aggregator for tests: a fixed list of pages returned in order,
/// one per `sync_transactions` call regardless of cursor value.
#[derive(Default)]
pub struct FakeAggregatorClient {
    pages: Mutex<Vec<SyncPage>>,
    balances: Mutex<Vec<AggregatorAccountBalance>>,
}

impl FakeAggregatorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, page: SyncPage) {
        self.pages.lock().unwrap().push(page);
    }

    pub fn set_balances(&self, balances: Vec<AggregatorAccountBalance>) {
        *self.balances.lock().unwrap() = balances;
    }

    pub fn single_page(added: Vec<AggregatorTransaction>, next_cursor: &str) -> SyncPage {
        SyncPage {
            added,
            modified: Vec::new(),
            removed: Vec::new(),
            next_cursor: next_cursor.to_string(),
            has_more: false,
        }
    }
}

#[async_trait]
impl AggregatorClient for FakeAggregatorClient {
    async fn sync_transactions(&self, _access_token: &str, _cursor: Option<&str>) -> Result<SyncPage> {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            return Ok(SyncPage {
                added: Vec::new(),
                modified: Vec::new(),
                removed: Vec::new(),
                next_cursor: "done".to_string(),
                has_more: false,
            });
        }
        Ok(pages.remove(0))
    }

    async fn get_balances(&self, _access_token: &str) -> Result<Vec<AggregatorAccountBalance>> {
        Ok(self.balances.lock().unwrap().clone())
    }
}
