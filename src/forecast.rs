use anyhow::Result;
use rand::prelude::*;
use rusqlite::params;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::storage::Db;

pub const MC_TRIALS: usize = 1000;
const SUSTAINABILITY_YEARS: u32 = 30;

/// Conservative withdrawal-phase drift: zero real-return drift during
/// sustainability simulation (see DESIGN.md for the reasoning).
const SUSTAINABILITY_DRIFT: f64 = 0.0;

pub struct ForecastInputs {
    pub horizon_months: u32,
    pub withdrawal_rate: f64,
    pub inflation_rate: f64,
}

impl Default for ForecastInputs {
    fn default() -> Self {
        Self { horizon_months: 12, withdrawal_rate: 0.04, inflation_rate: 0.03 }
    }
}

impl ForecastInputs {
    pub fn clamped(horizon_months: u32, withdrawal_rate: f64, inflation_rate: f64) -> Self {
        Self {
            horizon_months,
            withdrawal_rate: withdrawal_rate.clamp(0.01, 0.10),
            inflation_rate: inflation_rate.clamp(0.00, 0.15),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastSummary {
    pub avg_monthly_savings: f64,
    pub fire_number: f64,
    pub liquid_net_worth: f64,
    pub fire_probability: Option<u32>,
    pub months_to_fire_p10: Option<f64>,
    pub months_to_fire_p50: Option<f64>,
    pub months_to_fire_p90: Option<f64>,
    pub sustainability_rate: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scenarios {
    pub base: Vec<f64>,
    pub optimistic: Vec<f64>,
    pub pessimistic: Vec<f64>,
    pub percentiles: PercentileTrajectories,
}

#[derive(Debug, Clone, Serialize)]
pub struct PercentileTrajectories {
    pub p10: Vec<f64>,
    pub p25: Vec<f64>,
    pub p50: Vec<f64>,
    pub p75: Vec<f64>,
    pub p90: Vec<f64>,
}

/// Build and persist a forecast snapshot. Requires at least 5
/// historical net-worth snapshots; returns `Ok(None)` silently otherwise.
pub async fn generate(
    db: &Db,
    user_id: &str,
    inputs: &ForecastInputs,
    seed: u64,
) -> Result<Option<(Scenarios, ForecastSummary)>> {
    let history = load_history(db, user_id).await?;
    if history.len() < 5 {
        return Ok(None);
    }

    let avg_monthly_savings = linear_regression_slope(&history);
    let sigma = population_stdev(&first_differences(&history));

    let avg_monthly_expenses = load_avg_monthly_expenses(db, user_id).await?;
    let fire_number = (avg_monthly_expenses * 12.0) / inputs.withdrawal_rate;

    let current_net_worth = *history.last().unwrap();
    let illiquid = load_illiquid_total(db, user_id).await?;
    let liquid_net_worth = (current_net_worth - illiquid).max(0.0);

    let net_worth_minus_illiquid: Vec<f64> = history.iter().map(|v| v - illiquid).collect();
    let liquid_sigma = population_stdev(&first_differences(&net_worth_minus_illiquid));

    let base = project(current_net_worth, avg_monthly_savings, inputs.horizon_months);
    let optimistic = project(current_net_worth, avg_monthly_savings + sigma, inputs.horizon_months);
    let pessimistic = project(current_net_worth, avg_monthly_savings - sigma, inputs.horizon_months);

    let mut rng = StdRng::seed_from_u64(seed);
    let (percentiles, crossing_months) =
        run_monte_carlo(&mut rng, liquid_net_worth, avg_monthly_savings, liquid_sigma, fire_number, inputs.horizon_months);

    let fire_probability = if crossing_months.is_empty() {
        None
    } else {
        Some(((crossing_months.len() as f64 / MC_TRIALS as f64) * 100.0).round() as u32)
    };

    let (months_to_fire_p10, months_to_fire_p50, months_to_fire_p90) = if crossing_months.is_empty() {
        (None, None, None)
    } else {
        let mut sorted = crossing_months.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        (Some(percentile(&sorted, 10.0)), Some(percentile(&sorted, 50.0)), Some(percentile(&sorted, 90.0)))
    };

    let sustainability_rate = if fire_number > 0.0 && liquid_net_worth > 0.0 {
        Some(simulate_sustainability(&mut rng, fire_number, liquid_sigma, fire_number * inputs.withdrawal_rate / 12.0, inputs.inflation_rate))
    } else {
        None
    };

    let scenarios = Scenarios { base, optimistic, pessimistic, percentiles };
    let summary = ForecastSummary {
        avg_monthly_savings,
        fire_number,
        liquid_net_worth,
        fire_probability,
        months_to_fire_p10,
        months_to_fire_p50,
        months_to_fire_p90,
        sustainability_rate,
    };

    persist(db, user_id, inputs.horizon_months, &scenarios, &summary).await?;

    Ok(Some((scenarios, summary)))
}

fn linear_regression_slope(series: &[f64]) -> f64 {
    let n = series.len() as f64;
    let xs: Vec<f64> = (0..series.len()).map(|i| i as f64).collect();
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = series.iter().sum::<f64>() / n;

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (x, y) in xs.iter().zip(series.iter()) {
        numerator += (x - x_mean) * (y - y_mean);
        denominator += (x - x_mean).powi(2);
    }

    if denominator == 0.0 { 0.0 } else { numerator / denominator }
}

fn first_differences(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| w[1] - w[0]).collect()
}

fn population_stdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn project(start: f64, drift: f64, horizon_months: u32) -> Vec<f64> {
    let mut value = start;
    let mut out = Vec::with_capacity(horizon_months as usize);
    for _ in 0..horizon_months {
        value += drift;
        out.push(value);
    }
    out
}

/// 1000 independent trials, each stepping monthly by `randNormal(drift,
/// sigma)`. Returns per-month percentile trajectories and
/// the list of first-crossing months for trials that ever reach `target`.
fn run_monte_carlo(
    rng: &mut StdRng,
    start: f64,
    drift: f64,
    sigma: f64,
    target: f64,
    horizon_months: u32,
) -> (PercentileTrajectories, Vec<f64>) {
    let mut per_month_values: Vec<Vec<f64>> = vec![Vec::with_capacity(MC_TRIALS); horizon_months as usize];
    let mut crossing_months = Vec::new();

    for _ in 0..MC_TRIALS {
        let mut value = start;
        let mut crossed_at: Option<u32> = None;

        for month in 0..horizon_months {
            value += standard_normal(rng) * sigma + drift;
            per_month_values[month as usize].push(value);
            if crossed_at.is_none() && value >= target {
                crossed_at = Some(month + 1);
            }
        }

        if let Some(month) = crossed_at {
            crossing_months.push(month as f64);
        }
    }

    let percentiles = PercentileTrajectories {
        p10: percentile_trajectory(&per_month_values, 10.0),
        p25: percentile_trajectory(&per_month_values, 25.0),
        p50: percentile_trajectory(&per_month_values, 50.0),
        p75: percentile_trajectory(&per_month_values, 75.0),
        p90: percentile_trajectory(&per_month_values, 90.0),
    };

    (percentiles, crossing_months)
}

fn percentile_trajectory(per_month_values: &[Vec<f64>], pct: f64) -> Vec<f64> {
    per_month_values
        .iter()
        .map(|values| {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            percentile(&sorted, pct)
        })
        .collect()
}

/// Simulate `30 * 12` months of withdrawals from each trial's FIRE-crossing
/// portfolio, applying zero real-return drift. Returns the
/// survival rate as a rounded percent.
fn simulate_sustainability(rng: &mut StdRng, starting_balance: f64, sigma: f64, monthly_withdrawal: f64, inflation_rate: f64) -> u32 {
    let months = SUSTAINABILITY_YEARS * 12;
    let mut survivors = 0u32;

    for _ in 0..MC_TRIALS {
        let mut balance = starting_balance;
        let mut withdrawal = monthly_withdrawal;
        let mut survived = true;

        for _ in 0..months {
            balance += standard_normal(rng) * sigma + SUSTAINABILITY_DRIFT;
            balance -= withdrawal;
            withdrawal *= 1.0 + inflation_rate / 12.0;
            if balance <= 0.0 {
                survived = false;
                break;
            }
        }

        if survived {
            survivors += 1;
        }
    }

    ((survivors as f64 / MC_TRIALS as f64) * 100.0).round() as u32
}

/// Box-Muller transform: two uniform draws, the first rejecting zero.
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.random_range(0.0001f64..1.0);
    let u2: f64 = rng.random_range(0.0f64..std::f64::consts::TAU);
    (-2.0 * u1.ln()).sqrt() * u2.cos()
}

/// Linear-interpolation percentile over a sorted slice.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    let frac = idx - lo as f64;

    if hi >= sorted.len() {
        sorted[sorted.len() - 1]
    } else {
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

async fn load_history(db: &Db, user_id: &str) -> Result<Vec<f64>> {
    let conn = db.lock().await;
    let mut stmt = conn.prepare(
        "SELECT net_worth FROM net_worth_snapshots WHERE user_id = ?1 ORDER BY snapshot_date ASC",
    )?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?.collect::<rusqlite::Result<Vec<f64>>>()?;
    Ok(rows)
}

async fn load_avg_monthly_expenses(db: &Db, user_id: &str) -> Result<f64> {
    let conn = db.lock().await;
    let value: f64 = conn.query_row(
        "SELECT COALESCE(AVG(json_extract(breakdown_json, '$.monthlyExpenses')), 0) \
         FROM net_worth_snapshots WHERE user_id = ?1 AND snapshot_date >= date('now', '-12 months')",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(value)
}

async fn load_illiquid_total(db: &Db, user_id: &str) -> Result<f64> {
    let conn = db.lock().await;
    let value: f64 = conn.query_row(
        "SELECT COALESCE(json_extract(breakdown_json, '$.illiquidTotal'), 0) \
         FROM net_worth_snapshots WHERE user_id = ?1 ORDER BY snapshot_date DESC LIMIT 1",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(value)
}

async fn persist(db: &Db, user_id: &str, horizon_months: u32, scenarios: &Scenarios, summary: &ForecastSummary) -> Result<()> {
    let conn = db.lock().await;
    conn.execute(
        "INSERT INTO forecast_snapshots (id, user_id, horizon_months, scenarios_json, summary_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            Uuid::new_v4().to_string(),
            user_id,
            horizon_months,
            serde_json::to_string(scenarios)?,
            serde_json::to_string(summary)?,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage;

    async fn seed_snapshots(db: &Db, values: &[f64]) {
        let conn = db.lock().await;
        conn.execute("INSERT INTO users (id, email, password_hash) VALUES ('u1', 'a@b.com', 'x')", [])
            .unwrap();
        for (i, value) in values.iter().enumerate() {
            conn.execute(
                "INSERT INTO net_worth_snapshots (id, user_id, snapshot_date, total_assets, total_liabilities, net_worth, breakdown_json) \
                 VALUES (?1, 'u1', ?2, ?3, 0, ?3, '{\"monthlyExpenses\": 3000, \"illiquidTotal\": 0}')",
                params![format!("s{i}"), format!("2026-01-{:02}", i + 1), value],
            )
            .unwrap();
        }
    }

    #[tokio::test]
    async fn fewer_than_five_snapshots_returns_silently() {
        let db = storage::open_in_memory().unwrap();
        seed_snapshots(&db, &[1000.0, 1100.0, 1200.0]).await;
        let result = generate(&db, "u1", &ForecastInputs::default(), 42).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn growing_net_worth_produces_positive_monthly_savings() {
        let db = storage::open_in_memory().unwrap();
        seed_snapshots(&db, &[10_000.0, 11_000.0, 12_000.0, 13_000.0, 14_000.0, 15_000.0]).await;
        let (_, summary) = generate(&db, "u1", &ForecastInputs::default(), 42).await.unwrap().unwrap();
        assert!(summary.avg_monthly_savings > 0.0);
        assert_eq!(summary.fire_number, 3000.0 * 12.0 / 0.04);
    }

    #[tokio::test]
    async fn monte_carlo_trajectories_have_horizon_length() {
        let db = storage::open_in_memory().unwrap();
        seed_snapshots(&db, &[10_000.0, 11_000.0, 12_000.0, 13_000.0, 14_000.0, 15_000.0]).await;
        let inputs = ForecastInputs::clamped(6, 0.04, 0.03);
        let (scenarios, _) = generate(&db, "u1", &inputs, 7).await.unwrap().unwrap();
        assert_eq!(scenarios.percentiles.p50.len(), 6);
        assert_eq!(scenarios.base.len(), 6);
    }

    #[test]
    fn percentile_interpolates_between_points() {
        let sorted = vec![0.0, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
        assert_eq!(percentile(&sorted, 50.0), 20.0);
    }

    #[test]
    fn withdrawal_rate_and_inflation_rate_clamp_to_bounds() {
        let inputs = ForecastInputs::clamped(12, 0.5, -1.0);
        assert_eq!(inputs.withdrawal_rate, 0.10);
        assert_eq!(inputs.inflation_rate, 0.00);
    }
}
