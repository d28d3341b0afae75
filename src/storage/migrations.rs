use anyhow::Result;
use rusqlite::Connection;

/// Idempotent schema creation — one `execute_batch` of
/// `CREATE TABLE IF NOT EXISTS` statements run at startup, safe to call on
/// every boot.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id             TEXT PRIMARY KEY,
            email          TEXT UNIQUE NOT NULL,
            password_hash  TEXT NOT NULL,
            plan           TEXT NOT NULL DEFAULT 'free',
            sub_status     TEXT NOT NULL DEFAULT 'active',
            created_at     INTEGER DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS refresh_tokens (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token_hash  TEXT NOT NULL,
            expires_at  INTEGER NOT NULL,
            created_at  INTEGER DEFAULT (unixepoch())
        );
        CREATE INDEX IF NOT EXISTS idx_refresh_tokens_user ON refresh_tokens(user_id);
        CREATE INDEX IF NOT EXISTS idx_refresh_tokens_hash ON refresh_tokens(token_hash);

        CREATE TABLE IF NOT EXISTS institution_links (
            id                 TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            source_kind        TEXT NOT NULL,
            credential_enc     TEXT,
            institution_name   TEXT NOT NULL,
            sync_cursor        TEXT,
            status             TEXT NOT NULL DEFAULT 'good',
            last_error_code    TEXT,
            last_error_message TEXT,
            last_synced_at     INTEGER,
            created_at         INTEGER DEFAULT (unixepoch())
        );
        CREATE INDEX IF NOT EXISTS idx_links_user ON institution_links(user_id);

        CREATE TABLE IF NOT EXISTS source_accounts (
            id                 TEXT PRIMARY KEY,
            link_id            TEXT NOT NULL REFERENCES institution_links(id) ON DELETE CASCADE,
            user_id            TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            external_account_id TEXT NOT NULL,
            name               TEXT NOT NULL,
            account_type       TEXT NOT NULL,
            subtype            TEXT,
            current_balance    REAL NOT NULL DEFAULT 0,
            available_balance  REAL,
            credit_limit       REAL,
            currency           TEXT NOT NULL DEFAULT 'USD',
            hidden             INTEGER NOT NULL DEFAULT 0,
            UNIQUE(link_id, external_account_id)
        );
        CREATE INDEX IF NOT EXISTS idx_source_accounts_user ON source_accounts(user_id);

        CREATE TABLE IF NOT EXISTS source_transactions (
            transaction_id       TEXT PRIMARY KEY,
            link_id              TEXT NOT NULL REFERENCES institution_links(id) ON DELETE CASCADE,
            user_id              TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            external_account_id  TEXT NOT NULL,
            amount               REAL NOT NULL,
            name                 TEXT NOT NULL,
            merchant             TEXT,
            categories_json      TEXT,
            pending              INTEGER NOT NULL DEFAULT 0,
            txn_date             TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_source_transactions_account ON source_transactions(external_account_id, link_id);
        CREATE INDEX IF NOT EXISTS idx_source_transactions_user ON source_transactions(user_id);

        CREATE TABLE IF NOT EXISTS ledger_account_map (
            institution      TEXT NOT NULL,
            external_id      TEXT NOT NULL,
            ledger_account_id TEXT NOT NULL,
            PRIMARY KEY (institution, external_id)
        );

        CREATE TABLE IF NOT EXISTS imported_txn_keys (
            external_id         TEXT NOT NULL,
            institution         TEXT NOT NULL,
            ledger_transaction_id TEXT NOT NULL,
            created_at          INTEGER DEFAULT (unixepoch()),
            PRIMARY KEY (external_id, institution)
        );

        CREATE TABLE IF NOT EXISTS manual_assets (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            asset_type      TEXT NOT NULL,
            current_value   REAL NOT NULL,
            valuation_source TEXT,
            value_as_of     TEXT,
            active          INTEGER NOT NULL DEFAULT 1,
            principal       REAL,
            annual_rate     REAL,
            start_date      TEXT,
            term_months     INTEGER,
            extra_json      TEXT,
            created_at      INTEGER DEFAULT (unixepoch())
        );
        CREATE INDEX IF NOT EXISTS idx_manual_assets_user ON manual_assets(user_id);

        CREATE TABLE IF NOT EXISTS asset_value_history (
            asset_id      TEXT NOT NULL REFERENCES manual_assets(id) ON DELETE CASCADE,
            recorded_date TEXT NOT NULL,
            value         REAL NOT NULL,
            source        TEXT,
            UNIQUE(asset_id, recorded_date)
        );

        CREATE TABLE IF NOT EXISTS note_payments (
            id               TEXT PRIMARY KEY,
            asset_id         TEXT NOT NULL REFERENCES manual_assets(id) ON DELETE CASCADE,
            payment_date     TEXT NOT NULL,
            amount           REAL NOT NULL,
            principal_portion REAL NOT NULL,
            interest_portion REAL NOT NULL,
            balance_after    REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_note_payments_asset ON note_payments(asset_id);

        CREATE TABLE IF NOT EXISTS net_worth_snapshots (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            snapshot_date   TEXT NOT NULL,
            total_assets    REAL NOT NULL,
            total_liabilities REAL NOT NULL,
            net_worth       REAL NOT NULL,
            breakdown_json  TEXT NOT NULL,
            UNIQUE(user_id, snapshot_date)
        );
        CREATE INDEX IF NOT EXISTS idx_net_worth_user_date ON net_worth_snapshots(user_id, snapshot_date);

        CREATE TABLE IF NOT EXISTS forecast_snapshots (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            horizon_months  INTEGER NOT NULL,
            scenarios_json  TEXT NOT NULL,
            summary_json    TEXT NOT NULL,
            created_at      INTEGER DEFAULT (unixepoch())
        );
        CREATE INDEX IF NOT EXISTS idx_forecast_user ON forecast_snapshots(user_id);

        CREATE TABLE IF NOT EXISTS merchant_history (
            merchant TEXT NOT NULL,
            txn_date TEXT NOT NULL,
            amount   REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_merchant_history_merchant_date ON merchant_history(merchant, txn_date);

        CREATE TABLE IF NOT EXISTS merchant_categories (
            merchant TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            source   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_rules (
            id           TEXT PRIMARY KEY,
            user_id      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            rule_type    TEXT NOT NULL,
            threshold    REAL,
            filter_json  TEXT,
            severity     TEXT NOT NULL,
            enabled      INTEGER NOT NULL DEFAULT 1,
            notify_push  INTEGER NOT NULL DEFAULT 1,
            created_at   INTEGER DEFAULT (unixepoch())
        );
        CREATE INDEX IF NOT EXISTS idx_alert_rules_user_type ON alert_rules(user_id, rule_type);

        CREATE TABLE IF NOT EXISTS alert_history (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            rule_type   TEXT NOT NULL,
            severity    TEXT NOT NULL,
            title       TEXT NOT NULL,
            message     TEXT NOT NULL,
            metadata_json TEXT,
            sent_at     INTEGER DEFAULT (unixepoch()),
            read_at     INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_alert_history_user ON alert_history(user_id, sent_at);

        CREATE TABLE IF NOT EXISTS sync_log (
            id                TEXT PRIMARY KEY,
            user_id           TEXT REFERENCES users(id) ON DELETE CASCADE,
            institution       TEXT NOT NULL,
            method            TEXT NOT NULL,
            status            TEXT NOT NULL,
            transactions_added INTEGER NOT NULL DEFAULT 0,
            error_message     TEXT,
            started_at        INTEGER DEFAULT (unixepoch()),
            completed_at      INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_sync_log_user ON sync_log(user_id);

        CREATE TABLE IF NOT EXISTS monthly_insights (
            id           TEXT PRIMARY KEY,
            user_id      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            year         INTEGER NOT NULL,
            month        INTEGER NOT NULL,
            summary_json TEXT NOT NULL,
            created_at   INTEGER DEFAULT (unixepoch()),
            UNIQUE(user_id, year, month)
        );

        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
