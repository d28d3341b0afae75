pub mod downloader;
pub mod ofx_sync;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use rusqlite::params;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregator::{self, AggregatorClient};
use crate::alerts::{self, AlertEvent};
use crate::api::state::AppState;
use crate::auth;
use crate::categorize;
use crate::forecast::{self, ForecastInputs};
use crate::insights;
use crate::ledger::LedgerClient;
use crate::networth;
use crate::parsers::RawTransaction;
use crate::storage::Db;

/// The fixed cron table. Each variant owns one registered task; on startup
/// every one of these is spawned, on shutdown every one is stopped in the
/// same order they're listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    RefreshBalances,
    SyncOfxSnapshot,
    AggregatorScrapeSnapshot,
    DailySnapshot,
    MonthlyInsights,
    WeeklyForecast,
    PropertyValuations,
    SubscriptionDetection,
    AnomalyCheck,
    AggregatorDeltaSyncAll,
    AggregatorBalanceRefresh,
}

const ALL_JOBS: &[JobKind] = &[
    JobKind::RefreshBalances,
    JobKind::SyncOfxSnapshot,
    JobKind::AggregatorScrapeSnapshot,
    JobKind::DailySnapshot,
    JobKind::MonthlyInsights,
    JobKind::WeeklyForecast,
    JobKind::PropertyValuations,
    JobKind::SubscriptionDetection,
    JobKind::AnomalyCheck,
    JobKind::AggregatorDeltaSyncAll,
    JobKind::AggregatorBalanceRefresh,
];

impl JobKind {
    fn name(self) -> &'static str {
        match self {
            JobKind::RefreshBalances => "refreshBalances",
            JobKind::SyncOfxSnapshot => "syncOfxSnapshot",
            JobKind::AggregatorScrapeSnapshot => "aggregatorScrapeSnapshot",
            JobKind::DailySnapshot => "dailySnapshot",
            JobKind::MonthlyInsights => "monthlyInsights",
            JobKind::WeeklyForecast => "weeklyForecast",
            JobKind::PropertyValuations => "propertyValuations",
            JobKind::SubscriptionDetection => "subscriptionDetection",
            JobKind::AnomalyCheck => "anomalyCheck",
            JobKind::AggregatorDeltaSyncAll => "aggregatorDeltaSyncAll",
            JobKind::AggregatorBalanceRefresh => "aggregatorBalanceRefresh",
        }
    }

    /// Whether `minute`/`hour`/`weekday` line up with this job's cron
    /// expression, checked one minute at a time by `next_fire`.
    fn matches(self, dt: &DateTime<Utc>) -> bool {
        let (minute, hour, day, weekday) = (dt.minute(), dt.hour(), dt.day(), dt.weekday());
        match self {
            JobKind::RefreshBalances => minute % 15 == 0,
            JobKind::SyncOfxSnapshot => minute == 0 && matches!(hour, 6 | 12 | 18),
            JobKind::AggregatorScrapeSnapshot => minute == 0 && hour == 7,
            JobKind::DailySnapshot => minute == 0 && hour == 0,
            JobKind::MonthlyInsights => minute == 0 && hour == 1 && day == 1,
            JobKind::WeeklyForecast => minute == 0 && hour == 3 && weekday == Weekday::Sun,
            JobKind::PropertyValuations => minute == 0 && hour == 4 && weekday == Weekday::Sun,
            JobKind::SubscriptionDetection => minute == 0 && hour == 8 && weekday == Weekday::Mon,
            JobKind::AnomalyCheck => minute == 0 && hour == 9,
            JobKind::AggregatorDeltaSyncAll => minute == 0 && hour % 4 == 0,
            JobKind::AggregatorBalanceRefresh => minute % 30 == 0,
        }
    }
}

/// Earliest whole minute strictly after `now` that satisfies `kind`'s cron
/// expression. A linear minute-by-minute scan is simple and, since the
/// widest gap in this table is one week, cheap enough to run once per tick.
fn next_fire(kind: JobKind, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut candidate = now
        .with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(now)
        + ChronoDuration::minutes(1);
    while !kind.matches(&candidate) {
        candidate += ChronoDuration::minutes(1);
    }
    candidate
}

/// Handle returned by [`spawn`]; call [`ScheduledRuntime::shutdown`] to stop
/// accepting new ticks and wait for in-flight jobs.
pub struct ScheduledRuntime {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScheduledRuntime {
    /// Signal every job loop to stop scheduling new ticks, then wait up to
    /// 10s for whatever's in flight to finish before giving up.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let wait = tokio::time::timeout(StdDuration::from_secs(10), futures_join_all(self.tasks)).await;
        if wait.is_err() {
            eprintln!("[scheduler] jobs still running after 10s, proceeding with shutdown anyway");
        }
    }
}

async fn futures_join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

/// Register and start every cron job in the fixed table.
pub fn spawn(state: AppState) -> ScheduledRuntime {
    let (shutdown_tx, _) = watch::channel(false);
    let tasks = ALL_JOBS
        .iter()
        .copied()
        .map(|kind| spawn_one(kind, state.clone(), shutdown_tx.subscribe()))
        .collect();
    ScheduledRuntime { shutdown_tx, tasks }
}

fn spawn_one(kind: JobKind, state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let fire_at = next_fire(kind, now);
            let sleep_for = (fire_at - now).to_std().unwrap_or(StdDuration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let state = state.clone();
            crate::background::run_isolated(kind.name(), async move { run_job(kind, &state).await }).await;
        }
    })
}

/// Run a single job body once (also the entry point for `scheduler run-once
/// <job>` on the CLI). Never panics the caller — every failure is logged.
pub async fn run_job(kind: JobKind, state: &AppState) {
    println!("[scheduler] running {}", kind.name());
    let result = match kind {
        JobKind::RefreshBalances => refresh_balances(state).await,
        JobKind::SyncOfxSnapshot => sync_ofx_then_snapshot(state).await,
        JobKind::AggregatorScrapeSnapshot => aggregator_scrape_then_snapshot(state).await,
        JobKind::DailySnapshot => snapshot_all_users(state).await,
        JobKind::MonthlyInsights => monthly_insights_all_users(state).await,
        JobKind::WeeklyForecast => weekly_forecast_all_users(state).await,
        JobKind::PropertyValuations => refresh_property_valuations(state).await,
        JobKind::SubscriptionDetection => subscription_detection(state).await,
        JobKind::AnomalyCheck => anomaly_check_all_users(state).await,
        JobKind::AggregatorDeltaSyncAll => aggregator_delta_sync_all(state).await,
        JobKind::AggregatorBalanceRefresh => aggregator_balance_refresh_all(state).await,
    };
    if let Err(err) = result {
        eprintln!("[scheduler] {} failed: {err}", kind.name());
    }
}

/// Parse a CLI job name (`scheduler run-once <job>`) into a [`JobKind`].
pub fn job_by_name(name: &str) -> Option<JobKind> {
    ALL_JOBS.iter().copied().find(|j| j.name().eq_ignore_ascii_case(name))
}

async fn user_ids(db: &Db) -> Vec<String> {
    let conn = db.lock().await;
    let mut stmt = match conn.prepare("SELECT id FROM users") {
        Ok(stmt) => stmt,
        Err(_) => return vec![],
    };
    stmt.query_map([], |row| row.get(0))
        .map(|rows| rows.filter_map(Result::ok).collect())
        .unwrap_or_default()
}

/// Per-user fan-out: enumerate users and run `body` for each,
/// logging and swallowing individual failures. With no users configured,
/// runs once with no user id (legacy single-tenant mode) — `body` is
/// responsible for no-op'ing sensibly when it gets `None`.
async fn for_each_user<F, Fut>(db: &Db, job_name: &str, mut body: F)
where
    F: FnMut(Option<String>) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let ids = user_ids(db).await;
    if ids.is_empty() {
        if let Err(err) = body(None).await {
            eprintln!("[scheduler] {job_name} (legacy single-tenant) failed: {err}");
        }
        return;
    }
    for id in ids {
        if let Err(err) = body(Some(id.clone())).await {
            eprintln!("[scheduler] {job_name} failed for user {id}: {err}");
        }
    }
}

async fn refresh_balances(state: &AppState) -> anyhow::Result<()> {
    let (db, push) = {
        let inner = state.inner.read().await;
        (inner.db.clone(), inner.push.clone())
    };

    let rows: Vec<(String, String, f64)> = {
        let conn = db.lock().await;
        let mut stmt = conn.prepare("SELECT user_id, name, current_balance FROM source_accounts WHERE hidden = 0")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    for (user_id, name, balance) in rows {
        let event = AlertEvent {
            event_type: "low_balance".into(),
            user_id: Some(user_id),
            account_name: Some(name),
            balance: Some(balance),
            ..Default::default()
        };
        if let Err(err) = alerts::evaluate_event(&db, push.as_deref(), &event).await {
            eprintln!("[scheduler] refreshBalances alert write failed: {err}");
        }
    }
    Ok(())
}

async fn sync_ofx_then_snapshot(state: &AppState) -> anyhow::Result<()> {
    run_ofx_sync(state).await;
    snapshot_all_users(state).await
}

async fn run_ofx_sync(state: &AppState) {
    let (db, ledger, push, service_url, download_dir, institutions) = {
        let inner = state.inner.read().await;
        (
            inner.db.clone(),
            inner.ledger.clone(),
            inner.push.clone(),
            inner.config.ofx_downloader_url.clone(),
            inner.config.download_dir.clone(),
            inner.config.ofx_institutions.clone(),
        )
    };
    let http = { state.inner.read().await.http.clone() };
    let downloader = downloader::HttpOfxDownloader::new(http, service_url, download_dir);

    let mut inner = state.inner.write().await;
    let ofx_state = inner.ofx_sync_state.clone();
    let cache = &mut inner.ledger_account_cache;
    ofx_sync::sync_all(&db, ledger.as_ref(), cache, &downloader, push.as_deref(), &ofx_state, &institutions).await;
    drop(inner);
}

async fn aggregator_scrape_then_snapshot(state: &AppState) -> anyhow::Result<()> {
    aggregator_delta_sync_all(state).await?;
    snapshot_all_users(state).await
}

async fn snapshot_all_users(state: &AppState) -> anyhow::Result<()> {
    let (db, ledger) = {
        let inner = state.inner.read().await;
        (inner.db.clone(), inner.ledger.clone())
    };
    for_each_user(&db, "snapshot", |user_id| {
        let db = db.clone();
        let ledger = ledger.clone();
        async move {
            let Some(user_id) = user_id else { return Ok(()) };
            networth::compute_snapshot(&db, ledger.as_ref(), &user_id).await?;
            Ok(())
        }
    })
    .await;
    Ok(())
}

async fn monthly_insights_all_users(state: &AppState) -> anyhow::Result<()> {
    let db = state.inner.read().await.db.clone();
    let now = Utc::now();
    for_each_user(&db, "monthlyInsights", |user_id| {
        let db = db.clone();
        async move {
            let Some(user_id) = user_id else { return Ok(()) };
            insights::generate_monthly(&db, &user_id, now.year(), now.month()).await?;
            Ok(())
        }
    })
    .await;
    Ok(())
}

/// Generates both the short (12mo) and long (60mo) horizon forecasts that
/// `GET /api/forecast/history` surfaces.
async fn weekly_forecast_all_users(state: &AppState) -> anyhow::Result<()> {
    let db = state.inner.read().await.db.clone();
    for_each_user(&db, "weeklyForecast", |user_id| {
        let db = db.clone();
        async move {
            let Some(user_id) = user_id else { return Ok(()) };
            for horizon in [12u32, 60u32] {
                let inputs = ForecastInputs::clamped(horizon, 0.04, 0.03);
                let seed = horizon as u64 ^ Utc::now().date_naive().and_hms_opt(0, 0, 0).map(|d| d.and_utc().timestamp() as u64).unwrap_or(0);
                forecast::generate(&db, &user_id, &inputs, seed).await?;
            }
            Ok(())
        }
    })
    .await;
    Ok(())
}

/// No detailed valuation-source contract is given for this job; treated as
/// a best-effort refresh that re-stamps today's
/// value into `asset_value_history` for every active real-estate asset so
/// the history table stays populated even between manual updates.
async fn refresh_property_valuations(state: &AppState) -> anyhow::Result<()> {
    let db = state.inner.read().await.db.clone();
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, current_value FROM manual_assets WHERE asset_type = 'real_estate' AND active = 1",
    )?;
    let rows: Vec<(String, f64)> =
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?.collect::<rusqlite::Result<Vec<_>>>()?;
    let today = Utc::now().format("%Y-%m-%d").to_string();
    for (asset_id, value) in rows {
        conn.execute(
            "INSERT INTO asset_value_history (asset_id, recorded_date, value, source) VALUES (?1, ?2, ?3, 'scheduled_refresh') \
             ON CONFLICT(asset_id, recorded_date) DO UPDATE SET value = excluded.value, source = excluded.source",
            params![asset_id, today, value],
        )?;
    }
    Ok(())
}

/// Recurring-charge heuristic: a merchant billed the same user at least 3
/// times in the trailing 35 days within 5% of its average amount, and isn't
/// already filed under the `subscriptions` category.
async fn subscription_detection(state: &AppState) -> anyhow::Result<()> {
    let (db, push) = {
        let inner = state.inner.read().await;
        (inner.db.clone(), inner.push.clone())
    };

    let candidates: Vec<(String, String, f64, String)> = {
        let conn = db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT user_id, merchant, AVG(amount) AS avg_amount, GROUP_CONCAT(amount) AS amounts \
             FROM source_transactions \
             WHERE amount > 0 AND merchant IS NOT NULL AND txn_date >= date('now', '-35 days') \
             GROUP BY user_id, merchant HAVING COUNT(*) >= 3",
        )?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    for (user_id, merchant, avg_amount, amounts_csv) in candidates {
        let amounts: Vec<f64> = amounts_csv.split(',').filter_map(|s| s.parse::<f64>().ok()).collect();
        if !is_consistent_amount(&amounts, avg_amount) {
            continue;
        }
        let already_known: Option<String> = {
            let conn = db.lock().await;
            conn.query_row(
                "SELECT category FROM merchant_categories WHERE merchant = ?1",
                params![merchant.trim().to_lowercase()],
                |row| row.get(0),
            )
            .ok()
        };
        if already_known.as_deref() == Some("subscriptions") {
            continue;
        }

        let event = AlertEvent {
            event_type: "new_subscription".into(),
            user_id: Some(user_id),
            amount: Some(avg_amount),
            description: Some(merchant),
            ..Default::default()
        };
        if let Err(err) = alerts::evaluate_event(&db, push.as_deref(), &event).await {
            eprintln!("[scheduler] subscriptionDetection alert write failed: {err}");
        }
    }
    Ok(())
}

/// True if `amounts`' population stdev is within 5% of `avg`, the
/// consistency bar that separates a recurring charge from a merchant a user
/// just happens to have paid three unrelated times.
fn is_consistent_amount(amounts: &[f64], avg: f64) -> bool {
    if amounts.is_empty() || avg <= 0.0 {
        return false;
    }
    let variance = amounts.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / amounts.len() as f64;
    (variance.sqrt() / avg) <= 0.05
}

async fn anomaly_check_all_users(state: &AppState) -> anyhow::Result<()> {
    let (db, push) = {
        let inner = state.inner.read().await;
        (inner.db.clone(), inner.push.clone())
    };

    let rows: Vec<(String, RawTransaction)> = {
        let conn = db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT user_id, transaction_id, amount, name, merchant, txn_date FROM source_transactions \
             WHERE txn_date >= date('now', '-1 day')",
        )?;
        stmt.query_map([], |row| {
            let user_id: String = row.get(0)?;
            Ok((
                user_id,
                RawTransaction {
                    id: Some(row.get(1)?),
                    amount: row.get(2)?,
                    name: row.get(3)?,
                    memo: row.get(4)?,
                    date: row.get(5)?,
                    kind: None,
                },
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    for (user_id, txn) in rows {
        for anomaly in categorize::detect_anomalies(&db, std::slice::from_ref(&txn)).await {
            let event = AlertEvent {
                event_type: "anomaly".into(),
                user_id: Some(user_id.clone()),
                description: Some(anomaly),
                ..Default::default()
            };
            if let Err(err) = alerts::evaluate_event(&db, push.as_deref(), &event).await {
                eprintln!("[scheduler] anomalyCheck alert write failed: {err}");
            }
        }
    }
    Ok(())
}

struct AggregatorLink {
    id: String,
    status: String,
}

async fn aggregator_links(db: &Db, exclude_status: Option<&str>) -> anyhow::Result<Vec<AggregatorLink>> {
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT id, status FROM institution_links WHERE source_kind = 'aggregator' AND (?1 IS NULL OR status != ?1)",
    )?;
    let rows = stmt
        .query_map(params![exclude_status], |row| Ok(AggregatorLink { id: row.get(0)?, status: row.get(1)? }))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

async fn aggregator_delta_sync_all(state: &AppState) -> anyhow::Result<()> {
    let (db, ledger, aggregator, encryption_key) = {
        let inner = state.inner.read().await;
        (inner.db.clone(), inner.ledger.clone(), inner.aggregator.clone(), auth::derive_process_key(&inner.config.encryption_key))
    };
    let links = aggregator_links(&db, Some("login_required")).await?;

    for link in links {
        let mut inner = state.inner.write().await;
        let cache = &mut inner.ledger_account_cache;
        let result =
            aggregator::sync::delta_sync(&db, aggregator.as_ref(), ledger.as_ref(), cache, &encryption_key, &link.id).await;
        drop(inner);
        if let Err(err) = result {
            eprintln!("[scheduler] aggregatorDeltaSyncAll failed for link {} (status {}): {err}", link.id, link.status);
        }
    }
    Ok(())
}

async fn aggregator_balance_refresh_all(state: &AppState) -> anyhow::Result<()> {
    let (db, ledger, aggregator, encryption_key) = {
        let inner = state.inner.read().await;
        (inner.db.clone(), inner.ledger.clone(), inner.aggregator.clone(), auth::derive_process_key(&inner.config.encryption_key))
    };

    let ids: Vec<String> = {
        let conn = db.lock().await;
        let mut stmt =
            conn.prepare("SELECT id FROM institution_links WHERE source_kind = 'aggregator' AND status = 'good'")?;
        stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for link_id in ids {
        let mut inner = state.inner.write().await;
        let cache = &mut inner.ledger_account_cache;
        let result = aggregator::sync::refresh_balances(&db, aggregator.as_ref(), ledger.as_ref(), cache, &encryption_key, &link_id).await;
        drop(inner);
        if let Err(err) = result {
            eprintln!("[scheduler] aggregatorBalanceRefresh failed for link {link_id}: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn refresh_balances_fires_every_fifteen_minutes() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 10, 3, 0).unwrap();
        let next = next_fire(JobKind::RefreshBalances, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 5, 10, 15, 0).unwrap());
    }

    #[test]
    fn sync_ofx_snapshot_fires_at_six_twelve_and_eighteen() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 6, 0, 0).unwrap();
        let next = next_fire(JobKind::SyncOfxSnapshot, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap());
    }

    #[test]
    fn weekly_forecast_fires_sunday_at_three_am() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(); // Monday
        let next = next_fire(JobKind::WeeklyForecast, now);
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 3);
    }

    #[test]
    fn monthly_insights_fires_on_the_first_at_one_am() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        let next = next_fire(JobKind::MonthlyInsights, now);
        assert_eq!(next.day(), 1);
        assert_eq!(next.hour(), 1);
        assert_eq!(next.month(), 4);
    }

    #[test]
    fn job_by_name_is_case_insensitive() {
        assert!(job_by_name("DAILYSNAPSHOT").is_some());
        assert!(job_by_name("not-a-job").is_none());
    }
}
