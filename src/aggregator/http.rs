use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

use super::{AggregatorAccountBalance, AggregatorClient, SyncPage};

const PAGE_SIZE: u32 = 500;

/// Live client for the aggregator's sync/balances endpoints, same
/// reqwest-bearer-json shape as `ledger::http::HttpLedgerClient`.
pub struct HttpAggregatorClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpAggregatorClient {
    pub fn new(http: reqwest::Client, base_url: String, client_id: String, client_secret: String) -> Self {
        Self { http, base_url, client_id, client_secret }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl AggregatorClient for HttpAggregatorClient {
    async fn sync_transactions(&self, access_token: &str, cursor: Option<&str>) -> Result<SyncPage> {
        let resp = self
            .http
            .post(self.url("/transactions/sync"))
            .json(&json!({
                "client_id": self.client_id,
                "secret": self.client_secret,
                "access_token": access_token,
                "cursor": cursor,
                "count": PAGE_SIZE,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!("aggregator sync_transactions failed: {}", resp.status());
        }

        #[derive(serde::Deserialize)]
        struct Raw {
            added: Vec<super::AggregatorTransaction>,
            modified: Vec<super::AggregatorTransaction>,
            removed: Vec<RemovedTxn>,
            next_cursor: String,
            has_more: bool,
        }
        #[derive(serde::Deserialize)]
        struct RemovedTxn {
            transaction_id: String,
        }

        let raw: Raw = resp.json().await?;
        Ok(SyncPage {
            added: raw.added,
            modified: raw.modified,
            removed: raw.removed.into_iter().map(|r| r.transaction_id).collect(),
            next_cursor: raw.next_cursor,
            has_more: raw.has_more,
        })
    }

    async fn get_balances(&self, access_token: &str) -> Result<Vec<AggregatorAccountBalance>> {
        let resp = self
            .http
            .post(self.url("/accounts/balance/get"))
            .json(&json!({
                "client_id": self.client_id,
                "secret": self.client_secret,
                "access_token": access_token,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!("aggregator get_balances failed: {}", resp.status());
        }

        #[derive(serde::Deserialize)]
        struct Raw {
            accounts: Vec<AggregatorAccountBalance>,
        }
        let raw: Raw = resp.json().await?;
        Ok(raw.accounts)
    }
}
