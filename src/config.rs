use std::path::PathBuf;

/// Process-wide configuration, read once from the environment at startup,
/// rather than pulling in a config-file crate for values this simple.
pub struct Config {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,

    pub ledger_url: String,
    pub ledger_token: String,

    /// >= 32 bytes, used to derive the AES-256-GCM key that protects
    /// `InstitutionLink` credentials at rest.
    pub encryption_key: String,

    pub llm_api_key: Option<String>,
    pub llm_base_url: String,

    pub push_url: Option<String>,
    pub push_topic: String,

    pub aggregator_client_id: String,
    pub aggregator_client_secret: String,
    pub aggregator_env: String,
    pub aggregator_webhook_url: Option<String>,

    pub download_dir: PathBuf,
    pub upload_dir: PathBuf,

    /// Base URL of the external scraper/downloader service that produces the
    /// OFX/QFX files the OFX sync job reads from `download_dir`.
    pub ofx_downloader_url: String,

    /// Fixed list of institutions the OFX sync job downloads on its own
    /// schedule — comma-separated.
    pub ofx_institutions: Vec<String>,

    pub jwt_access_secret: String,
    pub jwt_refresh_secret: String,
    pub access_token_minutes: i64,
    pub refresh_token_days: i64,

    pub app_url: String,
    pub node_env: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration, warning on missing-but-optional variables instead
    /// of failing startup over them.
    pub fn from_env() -> anyhow::Result<Self> {
        let encryption_key = env_or("ENCRYPTION_KEY", "");
        if encryption_key.len() < 32 {
            anyhow::bail!(
                "ENCRYPTION_KEY must be set to at least 32 characters (got {})",
                encryption_key.len()
            );
        }

        let llm_api_key = env_opt("LLM_API_KEY");
        if llm_api_key.is_none() {
            println!("  Warning: LLM_API_KEY not set — categorization will use rules only");
        }

        let push_url = env_opt("PUSH_URL");
        if push_url.is_none() {
            println!("  Warning: PUSH_URL not set — alerts will be DB-only, no push delivery");
        }

        Ok(Config {
            db_path: PathBuf::from(env_or("DATABASE_PATH", "./data/ledgerline.db")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8080").parse().unwrap_or(8080),

            ledger_url: env_or("LEDGER_URL", "http://localhost:9000"),
            ledger_token: env_or("LEDGER_TOKEN", ""),

            encryption_key,

            llm_api_key,
            llm_base_url: env_or("LLM_BASE_URL", "https://api.openai.com/v1"),

            push_url,
            push_topic: env_or("PUSH_TOPIC", "ledgerline-alerts"),

            aggregator_client_id: env_or("AGGREGATOR_CLIENT_ID", ""),
            aggregator_client_secret: env_or("AGGREGATOR_CLIENT_SECRET", ""),
            aggregator_env: env_or("AGGREGATOR_ENV", "sandbox"),
            aggregator_webhook_url: env_opt("AGGREGATOR_WEBHOOK_URL"),

            download_dir: PathBuf::from(env_or("DOWNLOAD_DIR", "./data/downloads")),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "./data/uploads")),
            ofx_downloader_url: env_or("OFX_DOWNLOADER_URL", "http://localhost:9100"),

            ofx_institutions: env_or("OFX_INSTITUTIONS", "chase,amex,schwab")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),

            jwt_access_secret: env_or("JWT_ACCESS_SECRET", "dev-access-secret-change-me"),
            jwt_refresh_secret: env_or("JWT_REFRESH_SECRET", "dev-refresh-secret-change-me"),
            access_token_minutes: env_or("ACCESS_TOKEN_MINUTES", "15").parse().unwrap_or(15),
            refresh_token_days: env_or("REFRESH_TOKEN_DAYS", "30").parse().unwrap_or(30),

            app_url: env_or("APP_URL", "http://localhost:5173"),
            node_env: env_or("NODE_ENV", "development"),
        })
    }

    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }
}
