use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::aggregator::AggregatorClient;
use crate::config::Config;
use crate::ledger::LedgerClient;
use crate::push::PushClient;
use crate::scheduler::ofx_sync::OfxSyncState;
use crate::storage::Db;

use super::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<RwLock<AppStateInner>>,
}

pub struct AppStateInner {
    pub db: Db,
    pub config: Arc<Config>,
    pub ledger: Arc<dyn LedgerClient>,
    pub aggregator: Arc<dyn AggregatorClient>,

    /// `None` when `PUSH_URL` isn't configured — alerts still write to
    /// `alert_history`, they just skip the push leg.
    pub push: Option<Arc<PushClient>>,

    pub http: reqwest::Client,
    pub rate_limiter: RateLimiter,

    /// `institution:externalId -> ledgerAccountId`, the process-local memo
    /// cache. Never invalidated during normal operation; repopulates lazily
    /// from the persistent mapping table on a cold start.
    pub ledger_account_cache: HashMap<String, String>,

    /// Per-institution consecutive OFX download failure count, shared
    /// between the HTTP-triggered force-sync handler and the scheduled OFX
    /// cron job so both see the same counter.
    pub ofx_sync_state: Arc<OfxSyncState>,
}

impl AppState {
    pub fn new(
        db: Db,
        config: Config,
        ledger: Arc<dyn LedgerClient>,
        aggregator: Arc<dyn AggregatorClient>,
    ) -> Self {
        let http = reqwest::Client::new();
        let push = config
            .push_url
            .clone()
            .map(|url| Arc::new(PushClient::new(http.clone(), url, config.push_topic.clone())));

        Self {
            inner: Arc::new(RwLock::new(AppStateInner {
                db,
                config: Arc::new(config),
                ledger,
                aggregator,
                push,
                http,
                rate_limiter: RateLimiter::new(),
                ledger_account_cache: HashMap::new(),
                ofx_sync_state: Arc::new(OfxSyncState::new()),
            })),
        }
    }
}
