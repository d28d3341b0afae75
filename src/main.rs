use std::sync::Arc;

use clap::Parser;

mod aggregator;
mod alerts;
mod amortization;
mod api;
mod auth;
mod background;
mod categorize;
mod cli;
mod config;
mod forecast;
mod insights;
mod ledger;
mod networth;
mod parsers;
mod push;
mod scheduler;
mod storage;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        cli::Command::Migrate => {
            let config = config::Config::from_env()?;
            storage::open(&config.db_path)?;
            println!("migrations applied to {}", config.db_path.display());
            Ok(())
        }
        cli::Command::Serve => {
            let config = config::Config::from_env()?;
            rt.block_on(api::serve(config))
        }
        cli::Command::RunJob { job } => {
            let config = config::Config::from_env()?;
            let Some(kind) = scheduler::job_by_name(&job) else {
                anyhow::bail!("unknown job: {job}");
            };
            rt.block_on(async move {
                let db = storage::open(&config.db_path)?;
                let http = reqwest::Client::new();
                let ledger: Arc<dyn ledger::LedgerClient> = Arc::new(ledger::http::HttpLedgerClient::new(
                    http.clone(),
                    config.ledger_url.clone(),
                    config.ledger_token.clone(),
                ));
                let aggregator_base = if config.aggregator_env == "production" {
                    "https://production.aggregator.example.com"
                } else {
                    "https://sandbox.aggregator.example.com"
                };
                let aggregator: Arc<dyn aggregator::AggregatorClient> =
                    Arc::new(aggregator::http::HttpAggregatorClient::new(
                        http,
                        aggregator_base.to_string(),
                        config.aggregator_client_id.clone(),
                        config.aggregator_client_secret.clone(),
                    ));
                let state = api::state::AppState::new(db, config, ledger, aggregator);
                scheduler::run_job(kind, &state).await;
                Ok(())
            })
        }
    }
}
