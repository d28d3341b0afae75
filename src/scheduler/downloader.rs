use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

/// One institution's scraped download: the OFX/QFX/CSV file paths it
/// produced, already sitting in the configured download directory.
///
/// `ledgerline` doesn't implement the scraping itself — it's an adapter
/// around whatever external downloader service fetches bank exports — so
/// this trait follows the same shape as `LedgerClient`/`AggregatorClient`:
/// one trait, one live HTTP-backed implementation, one in-memory fake for
/// tests.
#[async_trait]
pub trait OfxDownloader: Send + Sync {
    async fn download(&self, institution: &str) -> Result<Vec<PathBuf>>;
}

pub struct HttpOfxDownloader {
    http: reqwest::Client,
    service_url: String,
    download_dir: PathBuf,
}

impl HttpOfxDownloader {
    pub fn new(http: reqwest::Client, service_url: String, download_dir: PathBuf) -> Self {
        Self { http, service_url, download_dir }
    }
}

#[derive(serde::Deserialize)]
struct DownloadResponse {
    files: Vec<String>,
}

#[async_trait]
impl OfxDownloader for HttpOfxDownloader {
    async fn download(&self, institution: &str) -> Result<Vec<PathBuf>> {
        let resp = self
            .http
            .post(format!("{}/download/{institution}", self.service_url.trim_end_matches('/')))
            .send()
            .await?
            .error_for_status()?
            .json::<DownloadResponse>()
            .await?;

        Ok(resp.files.into_iter().map(|name| self.download_dir.join(name)).collect())
    }
}

#[cfg(test)]
pub mod fake {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Queues canned results per institution; defaults to an empty success
    /// (no files) for institutions that weren't explicitly queued.
    #[derive(Default)]
    pub struct FakeOfxDownloader {
        queued: Mutex<HashMap<String, Result<Vec<PathBuf>, String>>>,
    }

    impl FakeOfxDownloader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_files(&self, institution: &str, files: Vec<PathBuf>) {
            self.queued.lock().unwrap().insert(institution.to_string(), Ok(files));
        }

        pub fn queue_failure(&self, institution: &str, message: &str) {
            self.queued.lock().unwrap().insert(institution.to_string(), Err(message.to_string()));
        }
    }

    #[async_trait]
    impl OfxDownloader for FakeOfxDownloader {
        async fn download(&self, institution: &str) -> Result<Vec<PathBuf>> {
            match self.queued.lock().unwrap().remove(institution) {
                Some(Ok(files)) => Ok(files),
                Some(Err(message)) => anyhow::bail!(message),
                None => Ok(Vec::new()),
            }
        }
    }
}
