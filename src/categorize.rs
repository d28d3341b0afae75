use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde::Deserialize;

use crate::parsers::RawTransaction;
use crate::storage::Db;

/// Closed category vocabulary — authoritative and fixed. Anything that
/// doesn't land in this list — rule output or LLM output — coerces to
/// `other`.
pub const CATEGORIES: &[&str] = &[
    "shopping",
    "subscriptions",
    "dining",
    "gas",
    "income",
    "utilities",
    "healthcare",
    "transfer",
    "atm/cash",
    "groceries",
    "entertainment",
    "travel",
    "insurance",
    "housing",
    "education",
    "fees",
    "taxes",
    "investment",
    "donations",
    "other",
];

pub const OTHER: &str = "other";

pub fn is_known_category(category: &str) -> bool {
    CATEGORIES.contains(&category)
}

fn coerce(category: &str) -> String {
    if is_known_category(category) { category.to_string() } else { OTHER.to_string() }
}

/// A single rule condition: `Any` matches if the description contains the
/// substring; `All` matches if it contains every substring in the list,
/// regardless of order or what's between them — the stand-in for a
/// `"a.*b"`-style wildcard pattern without pulling in `regex`.
enum Pattern {
    Any(&'static str),
    All(&'static [&'static str]),
}

/// Ordered rule table. First match wins; matching is case-insensitive.
const RULES: &[(&[Pattern], &str)] = &[
    (
        &[Pattern::Any("amazon"), Pattern::Any("walmart"), Pattern::Any("target"), Pattern::Any("costco"), Pattern::Any("kroger")],
        "shopping",
    ),
    (
        &[
            Pattern::Any("netflix"),
            Pattern::Any("spotify"),
            Pattern::Any("hulu"),
            Pattern::Any("disney"),
            Pattern::All(&["apple", "sub"]),
        ],
        "subscriptions",
    ),
    (
        &[Pattern::Any("uber eat"), Pattern::Any("doordash"), Pattern::Any("grubhub"), Pattern::Any("chipotle"), Pattern::Any("mcdonald")],
        "dining",
    ),
    (
        &[
            Pattern::Any("shell"),
            Pattern::Any("chevron"),
            Pattern::Any("exxon"),
            Pattern::Any("bp"),
            Pattern::Any("mobil"),
            Pattern::All(&["gas", "station"]),
        ],
        "gas",
    ),
    (&[Pattern::Any("payroll"), Pattern::Any("salary"), Pattern::Any("direct dep")], "income"),
    (
        &[Pattern::Any("electric"), Pattern::All(&["gas", "util"]), Pattern::Any("water util"), Pattern::Any("xcel"), Pattern::Any("pg&e")],
        "utilities",
    ),
    (
        &[Pattern::Any("cvs"), Pattern::Any("walgreens"), Pattern::Any("pharmacy"), Pattern::Any("medical"), Pattern::Any("dental"), Pattern::Any("doctor")],
        "healthcare",
    ),
    (&[Pattern::Any("transfer"), Pattern::Any("zelle"), Pattern::Any("venmo"), Pattern::Any("paypal transfer")], "transfer"),
    (&[Pattern::Any("atm"), Pattern::Any("cash advance")], "atm/cash"),
];

fn rule_match(description: &str) -> Option<&'static str> {
    let lower = description.to_lowercase();
    for (patterns, category) in RULES {
        let matched = patterns.iter().any(|p| match p {
            Pattern::Any(s) => lower.contains(s),
            Pattern::All(all) => all.iter().all(|s| lower.contains(s)),
        });
        if matched {
            return Some(category);
        }
    }
    None
}

/// Categorize a batch of transactions: DB cache, then the rule table, then
/// one batched LLM call for anything still unmatched. Returns a
/// map keyed by the transaction's synthesized key (callers that need a
/// stable per-txn key should pass one via `RawTransaction.id`, falling back
/// to the row index).
pub async fn categorize(
    db: &Db,
    llm_api_key: Option<&str>,
    llm_base_url: &str,
    http: &reqwest::Client,
    txns: &[RawTransaction],
) -> HashMap<usize, String> {
    let mut result = HashMap::new();
    let mut unmatched_indices = Vec::new();

    for (idx, txn) in txns.iter().enumerate() {
        let key = txn.name.trim().to_lowercase();

        if let Some(cached) = cache_lookup(db, &key).await {
            result.insert(idx, cached);
            continue;
        }

        if let Some(category) = rule_match(&txn.name) {
            result.insert(idx, category.to_string());
            cache_write(db, &key, category, "rule").await;
            continue;
        }

        unmatched_indices.push(idx);
    }

    if unmatched_indices.is_empty() {
        return result;
    }

    let categories = match llm_api_key {
        Some(api_key) => {
            let descriptions: Vec<&str> = unmatched_indices.iter().map(|&i| txns[i].name.as_str()).collect();
            match call_llm(http, llm_base_url, api_key, &descriptions).await {
                Ok(cats) if cats.len() == descriptions.len() => cats,
                _ => vec![OTHER.to_string(); descriptions.len()],
            }
        }
        None => vec![OTHER.to_string(); unmatched_indices.len()],
    };

    for (slot, &idx) in unmatched_indices.iter().enumerate() {
        let category = coerce(&categories[slot]);
        let key = txns[idx].name.trim().to_lowercase();
        cache_write(db, &key, &category, "ai").await;
        result.insert(idx, category);
    }

    result
}

async fn cache_lookup(db: &Db, merchant_key: &str) -> Option<String> {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT category FROM merchant_categories WHERE merchant = ?1",
        params![merchant_key],
        |row| row.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

/// ON CONFLICT DO NOTHING — first decision wins for stability.
async fn cache_write(db: &Db, merchant_key: &str, category: &str, source: &str) {
    let conn = db.lock().await;
    let _ = conn.execute(
        "INSERT INTO merchant_categories (merchant, category, source) VALUES (?1, ?2, ?3) \
         ON CONFLICT(merchant) DO NOTHING",
        params![merchant_key, category, source],
    );
}

#[derive(Deserialize)]
struct LlmCategoryResponse {
    categories: Vec<String>,
}

/// One batched prompt expecting a JSON array of category strings in input
/// order, sent as a bearer-authenticated JSON POST.
async fn call_llm(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    descriptions: &[&str],
) -> Result<Vec<String>> {
    let prompt = format!(
        "Classify each transaction description into exactly one of these categories: {}. \
         Respond with a JSON object {{\"categories\": [...]}} with one category per \
         description, in the same order.\n\nDescriptions:\n{}",
        CATEGORIES.join(", "),
        descriptions.iter().enumerate().map(|(i, d)| format!("{i}. {d}")).collect::<Vec<_>>().join("\n"),
    );

    let resp = http
        .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
        .bearer_auth(api_key)
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "response_format": { "type": "json_object" },
            "messages": [{ "role": "user", "content": prompt }],
        }))
        .send()
        .await?;

    if !resp.status().is_success() {
        anyhow::bail!("llm categorize failed: {}", resp.status());
    }

    #[derive(Deserialize)]
    struct Choice {
        message: Message,
    }
    #[derive(Deserialize)]
    struct Message {
        content: String,
    }
    #[derive(Deserialize)]
    struct ChatResponse {
        choices: Vec<Choice>,
    }

    let chat: ChatResponse = resp.json().await?;
    let content = chat.choices.first().map(|c| c.message.content.as_str()).unwrap_or("{}");
    let parsed: LlmCategoryResponse = serde_json::from_str(content)?;
    Ok(parsed.categories)
}

/// Anomaly detection against 90-day merchant history. Returns
/// a description string for each anomaly fired; always records the
/// observation in `merchant_history` regardless of outcome. Credits/income
/// (amount ≤ 0 in withdrawal-negative convention) never fire.
pub async fn detect_anomalies(db: &Db, txns: &[RawTransaction]) -> Vec<String> {
    let mut anomalies = Vec::new();

    for txn in txns {
        if txn.amount <= 0.0 {
            continue;
        }
        let merchant = txn.name.trim().to_lowercase();

        if let Some((avg, count)) = merchant_stats(db, &merchant).await {
            if count == 0 && txn.amount > 100.0 {
                anomalies.push(format!("New merchant: {} — ${:.2}", txn.name, txn.amount));
            } else if count > 0 && avg > 0.0 && txn.amount > 2.5 * avg {
                anomalies.push(format!("Unusually large: {} ${:.2} (avg ${:.2})", txn.name, txn.amount, avg));
            }
        }

        record_history(db, &merchant, txn.amount, &txn.date).await;
    }

    anomalies
}

async fn merchant_stats(db: &Db, merchant: &str) -> Option<(f64, u32)> {
    let conn = db.lock().await;
    conn.query_row(
        "SELECT COALESCE(AVG(amount), 0), COUNT(*) FROM merchant_history \
         WHERE merchant = ?1 AND txn_date >= date('now', '-90 days')",
        params![merchant],
        |row| Ok((row.get::<_, f64>(0)?, row.get::<_, i64>(1)? as u32)),
    )
    .optional()
    .ok()
    .flatten()
}

async fn record_history(db: &Db, merchant: &str, amount: f64, date: &str) {
    let conn = db.lock().await;
    let _ = conn.execute(
        "INSERT INTO merchant_history (merchant, txn_date, amount) VALUES (?1, ?2, ?3)",
        params![merchant, date, amount],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    fn txn(name: &str, amount: f64) -> RawTransaction {
        RawTransaction { id: None, date: "2026-01-01".into(), name: name.into(), amount, kind: None, memo: None }
    }

    #[tokio::test]
    async fn rule_table_matches_before_hitting_the_llm() {
        let db = storage::open_in_memory().unwrap();
        let http = reqwest::Client::new();
        let txns = vec![txn("AMAZON MARKETPLACE", -20.0), txn("SHELL OIL 12345", -40.0)];

        let result = categorize(&db, None, "http://unused", &http, &txns).await;
        assert_eq!(result.get(&0).unwrap(), "shopping");
        assert_eq!(result.get(&1).unwrap(), "gas");
    }

    #[tokio::test]
    async fn unmatched_without_llm_key_falls_back_to_other() {
        let db = storage::open_in_memory().unwrap();
        let http = reqwest::Client::new();
        let txns = vec![txn("SOME RANDOM MERCHANT XYZ", -20.0)];

        let result = categorize(&db, None, "http://unused", &http, &txns).await;
        assert_eq!(result.get(&0).unwrap(), OTHER);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_rule_table() {
        let db = storage::open_in_memory().unwrap();
        let http = reqwest::Client::new();
        cache_write(&db, "custom shop", "travel", "rule").await;

        let txns = vec![txn("CUSTOM SHOP", -20.0)];
        let result = categorize(&db, None, "http://unused", &http, &txns).await;
        assert_eq!(result.get(&0).unwrap(), "travel");
    }

    #[tokio::test]
    async fn new_merchant_over_threshold_fires_anomaly() {
        let db = storage::open_in_memory().unwrap();
        let anomalies = detect_anomalies(&db, &[txn("BIG PURCHASE CO", 150.0)]).await;
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].contains("New merchant"));
    }

    #[tokio::test]
    async fn new_merchant_under_threshold_does_not_fire() {
        let db = storage::open_in_memory().unwrap();
        let anomalies = detect_anomalies(&db, &[txn("SMALL PURCHASE CO", 50.0)]).await;
        assert!(anomalies.is_empty());
    }

    #[tokio::test]
    async fn established_merchant_spike_fires_anomaly() {
        let db = storage::open_in_memory().unwrap();
        for _ in 0..5 {
            detect_anomalies(&db, &[txn("COFFEE SHOP", 5.0)]).await;
        }
        let anomalies = detect_anomalies(&db, &[txn("COFFEE SHOP", 50.0)]).await;
        assert!(anomalies.iter().any(|a| a.contains("Unusually large")));
    }

    #[tokio::test]
    async fn credits_never_fire_anomalies() {
        let db = storage::open_in_memory().unwrap();
        let anomalies = detect_anomalies(&db, &[txn("PAYCHECK", -3000.0)]).await;
        assert!(anomalies.is_empty());
    }
}
