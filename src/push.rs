use anyhow::{Result, bail};

/// Thin POST client for the push transport (ntfy-shaped: topic URL, `Title`/
/// `Priority`/`Tags` headers, plain-text body). A non-2xx response is treated
/// as a recoverable failure rather than a hard error.
pub struct PushClient {
    http: reqwest::Client,
    url: String,
    topic: String,
}

impl PushClient {
    pub fn new(http: reqwest::Client, url: String, topic: String) -> Self {
        Self { http, url, topic }
    }

    pub async fn send(&self, title: &str, message: &str, priority: &str, tags: &[&str]) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/{}", self.url.trim_end_matches('/'), self.topic))
            .header("Title", title)
            .header("Priority", priority)
            .header("Tags", tags.join(","))
            .body(message.to_string())
            .send()
            .await?;

        if !resp.status().is_success() {
            bail!("push transport returned {}", resp.status());
        }
        Ok(())
    }
}

/// critical → max, high → high, else → default.
pub fn priority_for_severity(severity: &str) -> &'static str {
    match severity {
        "critical" => "max",
        "high" => "high",
        _ => "default",
    }
}
