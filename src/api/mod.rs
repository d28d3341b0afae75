pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{delete, get, patch, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::aggregator::AggregatorClient;
use crate::aggregator::http::HttpAggregatorClient;
use crate::config::Config;
use crate::ledger::LedgerClient;
use crate::ledger::http::HttpLedgerClient;
use crate::storage;

use state::AppState;

const UPLOAD_BODY_LIMIT_BYTES: usize = 50 * 1024 * 1024;

/// Build the database, external clients, app state, router, and scheduler,
/// then serve until a shutdown signal arrives.
pub async fn serve(config: Config) -> Result<()> {
    let db = storage::open(&config.db_path).with_context(|| format!("opening database at {}", config.db_path.display()))?;

    let http = reqwest::Client::new();
    let ledger: Arc<dyn LedgerClient> =
        Arc::new(HttpLedgerClient::new(http.clone(), config.ledger_url.clone(), config.ledger_token.clone()));
    let aggregator: Arc<dyn AggregatorClient> = Arc::new(HttpAggregatorClient::new(
        http.clone(),
        aggregator_base_url(&config.aggregator_env),
        config.aggregator_client_id.clone(),
        config.aggregator_client_secret.clone(),
    ));

    let host = config.host.clone();
    let port = config.port;
    let state = AppState::new(db, config, ledger, aggregator);

    let scheduler = crate::scheduler::spawn(state.clone());

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = router(state);
    let app = app.layer(cors);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;
    println!("ledgerline API listening on {addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    scheduler.shutdown().await;
    Ok(())
}

/// The aggregator base URL isn't itself configurable; `AGGREGATOR_ENV` just
/// picks which of the provider's two fixed hosts to talk to.
fn aggregator_base_url(env: &str) -> String {
    if env == "production" {
        "https://production.aggregator.example.com".to_string()
    } else {
        "https://sandbox.aggregator.example.com".to_string()
    }
}

fn router(state: AppState) -> Router {
    use handlers::{alerts, assets, auth, billing, forecasting, insights, networth, plaid, sync, upload};

    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me).put(auth::update_me))
        .route("/password", put(auth::change_password))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth_rate_limit));

    let asset_routes = Router::new()
        .route("/", get(assets::list_assets).post(assets::create_asset))
        .route("/{id}", put(assets::update).delete(assets::delete))
        .route("/{id}/note-payment", post(assets::note_payment))
        .route("/{id}/history", get(assets::history))
        .route("/{id}/amortization", get(assets::amortization_schedule))
        .route("/{id}/payments", get(assets::payments));

    let insurance_routes = Router::new().route("/", get(assets::list_insurance).post(assets::create_insurance));

    let networth_routes = Router::new()
        .route("/current", get(networth::current))
        .route("/history", get(networth::history))
        .route("/breakdown", get(networth::breakdown))
        .route("/snapshot", post(networth::snapshot));

    let forecasting_routes = Router::new()
        .route("/latest", get(forecasting::latest))
        .route("/history", get(forecasting::history))
        .route("/{id}", get(forecasting::get_one))
        .route("/generate", post(forecasting::generate))
        .route("/whatif", post(forecasting::whatif));

    let alert_routes = Router::new()
        .route("/", get(alerts::list))
        .route("/unread-count", get(alerts::unread_count))
        .route("/{id}/read", post(alerts::mark_read))
        .route("/{id}", delete(alerts::delete))
        .route("/rules", get(alerts::list_rules).post(alerts::create_rule))
        .route("/rules/{id}", put(alerts::update_rule).delete(alerts::delete_rule))
        .route("/test", post(alerts::test));

    let insights_routes = Router::new()
        .route("/latest", get(insights::latest))
        .route("/", get(insights::list))
        .route("/generate", post(insights::generate))
        .route("/spending", get(insights::spending))
        .route("/categories", get(insights::categories))
        .route("/savings-rate", get(insights::savings_rate))
        .route("/emergency-fund", get(insights::emergency_fund));

    let sync_routes = Router::new()
        .route("/status", get(sync::status))
        .route("/log", get(sync::log))
        .route("/force/{linkId}", post(sync::force))
        .route("/snapshot", post(sync::snapshot));

    let plaid_routes = Router::new()
        .route("/link-token", post(plaid::link_token))
        .route("/exchange", post(plaid::exchange))
        .route("/items", get(plaid::items))
        .route("/items/{itemId}", delete(plaid::delete_item))
        .route("/sync-all", post(plaid::sync_all))
        .route("/sync/{itemId}", post(plaid::sync_one))
        .route("/transactions", get(plaid::transactions))
        .route("/accounts/{id}", patch(plaid::update_account))
        .route("/webhook", post(plaid::webhook));

    let upload_routes = Router::new()
        .route("/", post(upload::upload))
        .layer(RequestBodyLimitLayer::new(UPLOAD_BODY_LIMIT_BYTES));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/billing/plans", get(billing::plans))
        .route("/api/billing/webhook", post(billing::webhook))
        .nest("/api/auth", auth_routes)
        .nest("/api/assets", asset_routes)
        .nest("/api/insurance", insurance_routes)
        .nest("/api/networth", networth_routes)
        .nest("/api/forecasting", forecasting_routes)
        .nest("/api/alerts", alert_routes)
        .nest("/api/insights", insights_routes)
        .nest("/api/sync", sync_routes)
        .nest("/api/plaid", plaid_routes)
        .nest("/api/upload", upload_routes)
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::global_rate_limit))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
