use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::json;

use super::{CreateTransactionRequest, LedgerAccount, LedgerClient};

/// Live client for the external ledger's REST API: bearer header, `.json()`
/// body, status check.
pub struct HttpLedgerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpLedgerClient {
    pub fn new(http: reqwest::Client, base_url: String, token: String) -> Self {
        Self { http, base_url, token }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn list_accounts(&self) -> Result<Vec<LedgerAccount>> {
        let resp = self
            .http
            .get(self.url("/api/v1/accounts"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("ledger list_accounts failed: {}", resp.status());
        }
        #[derive(serde::Deserialize)]
        struct Page {
            data: Vec<LedgerAccount>,
        }
        let page: Page = resp.json().await?;
        Ok(page.data)
    }

    async fn create_account(&self, name: &str, account_type: &str, currency: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/api/v1/accounts"))
            .bearer_auth(&self.token)
            .json(&json!({ "name": name, "type": account_type, "currency": currency }))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("ledger create_account failed: {}", resp.status());
        }
        #[derive(serde::Deserialize)]
        struct Created {
            data: LedgerAccount,
        }
        let created: Created = resp.json().await?;
        Ok(created.data.id)
    }

    async fn create_transaction(&self, req: CreateTransactionRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/api/v1/transactions"))
            .bearer_auth(&self.token)
            .json(&json!({ "transactions": [req] }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("ledger create_transaction failed: {body}");
        }
        #[derive(serde::Deserialize)]
        struct CreatedTxn {
            id: String,
        }
        #[derive(serde::Deserialize)]
        struct Created {
            data: Vec<CreatedTxn>,
        }
        let created: Created = resp.json().await?;
        created
            .data
            .into_iter()
            .next()
            .map(|t| t.id)
            .ok_or_else(|| anyhow::anyhow!("ledger create_transaction returned no transaction id"))
    }

    async fn update_account_balance(&self, ledger_account_id: &str, balance: f64, date: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/api/v1/accounts/{ledger_account_id}/reconcile")))
            .bearer_auth(&self.token)
            .json(&json!({ "balance": balance, "date": date }))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("ledger update_account_balance failed: {}", resp.status());
        }
        Ok(())
    }
}
