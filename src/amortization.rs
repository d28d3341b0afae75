use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// One row of a printed amortization schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub month: u32,
    pub payment: f64,
    pub principal: f64,
    pub interest: f64,
    pub balance: f64,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmortizationResult {
    pub monthly_payment: f64,
    pub current_balance: f64,
    pub total_paid: f64,
    pub total_interest_paid: f64,
    pub payoff_date: String,
    pub months_remaining: u32,
    pub schedule: Option<Vec<ScheduleEntry>>,
}

pub struct AmortizationInput {
    pub principal: f64,
    pub annual_rate_percent: f64,
    pub term_months: u32,
    pub start_date: NaiveDate,
    pub payments_made: Option<u32>,
    pub include_schedule: bool,
}

/// Compute an amortization schedule and current state. All
/// output scalars are rounded to 2 decimals except `month`/`months_remaining`.
pub fn amortize(input: &AmortizationInput) -> AmortizationResult {
    let r = input.annual_rate_percent / 1200.0;
    let n = input.term_months;

    let monthly_payment = monthly_payment(input.principal, r, n);

    let payments_made = input
        .payments_made
        .unwrap_or_else(|| months_between(input.start_date, today()).clamp(0, n as i64) as u32)
        .min(n);

    let (current_balance, total_principal_paid, total_interest_paid) =
        run_schedule(input.principal, r, monthly_payment, payments_made);

    let total_paid = total_principal_paid + total_interest_paid;
    let months_remaining = n.saturating_sub(payments_made);
    let payoff_date = add_months(input.start_date, n);

    let schedule = if input.include_schedule {
        Some(build_schedule(input.principal, r, monthly_payment, n, input.start_date))
    } else {
        None
    };

    AmortizationResult {
        monthly_payment: round2(monthly_payment),
        current_balance: round2(current_balance),
        total_paid: round2(total_paid),
        total_interest_paid: round2(total_interest_paid),
        payoff_date: payoff_date.format("%Y-%m-%d").to_string(),
        months_remaining,
        schedule,
    }
}

fn monthly_payment(principal: f64, r: f64, term_months: u32) -> f64 {
    if term_months == 0 {
        return 0.0;
    }
    if r == 0.0 {
        return principal / term_months as f64;
    }
    let factor = (1.0 + r).powi(term_months as i32);
    principal * r * factor / (factor - 1.0)
}

/// Iterate the payment recurrence `payments_made` times on a fresh principal
/// copy, returning (balance, principal_paid, interest_paid).
fn run_schedule(principal: f64, r: f64, payment: f64, payments_made: u32) -> (f64, f64, f64) {
    let mut balance = principal;
    let mut total_principal = 0.0;
    let mut total_interest = 0.0;

    for _ in 0..payments_made {
        let interest = balance * r;
        let principal_portion = (payment - interest).min(balance);
        balance = (balance - principal_portion).max(0.0);
        total_principal += principal_portion;
        total_interest += interest;
    }

    (balance, total_principal, total_interest)
}

fn build_schedule(
    principal: f64,
    r: f64,
    payment: f64,
    term_months: u32,
    start_date: NaiveDate,
) -> Vec<ScheduleEntry> {
    let mut balance = principal;
    let mut schedule = Vec::with_capacity(term_months as usize);

    for month in 1..=term_months {
        if balance <= 0.0 {
            break;
        }
        let interest = balance * r;
        let principal_portion = (payment - interest).min(balance);
        balance = (balance - principal_portion).max(0.0);

        schedule.push(ScheduleEntry {
            month,
            payment: round2(principal_portion + interest),
            principal: round2(principal_portion),
            interest: round2(interest),
            balance: round2(balance),
            date: add_months(start_date, month).format("%Y-%m-%d").to_string(),
        });
    }

    schedule
}

fn months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    let months = (to.year() as i64 - from.year() as i64) * 12 + (to.month() as i64 - from.month() as i64);
    if to.day() < from.day() { months - 1 } else { months }
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    let total = date.year() * 12 + date.month() as i32 - 1 + months as i32;
    let year = total / 12;
    let month = (total % 12 + 1) as u32;
    let day = date.day().min(days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    next.map(|d| d.pred_opt().unwrap().day()).unwrap_or(28)
}

fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(payments_made: Option<u32>, include_schedule: bool) -> AmortizationInput {
        AmortizationInput {
            principal: 300_000.0,
            annual_rate_percent: 7.0,
            term_months: 360,
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            payments_made,
            include_schedule,
        }
    }

    #[test]
    fn thirty_year_mortgage_matches_expected_payment() {
        let result = amortize(&input(Some(0), false));
        assert!((result.monthly_payment - 1995.91).abs() < 1.0);
        assert!((result.current_balance - 300_000.0).abs() < 0.01);
        assert_eq!(result.months_remaining, 360);
        assert_eq!(result.payoff_date, "2050-01-01");
    }

    #[test]
    fn sixty_payments_reduces_balance_and_accumulates_paid() {
        let result = amortize(&input(Some(60), false));
        assert!(result.current_balance < 300_000.0);
        assert!(result.current_balance > 0.0);
        assert!((result.total_paid - result.monthly_payment * 60.0).abs() < 1.0);
        assert_eq!(result.months_remaining, 300);
    }

    #[test]
    fn full_term_drives_balance_to_near_zero() {
        let result = amortize(&input(Some(360), false));
        assert!(result.current_balance <= 0.01);
        assert_eq!(result.months_remaining, 0);
    }

    #[test]
    fn zero_rate_uses_simple_division() {
        let mut i = input(Some(0), false);
        i.annual_rate_percent = 0.0;
        i.principal = 12_000.0;
        i.term_months = 12;
        let result = amortize(&i);
        assert_eq!(result.monthly_payment, 1000.0);
    }

    #[test]
    fn schedule_terminates_early_once_balance_hits_zero() {
        let result = amortize(&input(Some(0), true));
        let schedule = result.schedule.unwrap();
        assert!(schedule.len() <= 360);
        assert!(schedule.last().unwrap().balance <= 0.01);
    }

    #[test]
    fn schedule_principal_sums_to_roughly_the_principal() {
        let result = amortize(&input(Some(0), true));
        let schedule = result.schedule.unwrap();
        let total_principal: f64 = schedule.iter().map(|e| e.principal).sum();
        assert!((total_principal - 300_000.0).abs() < 1.0);
    }

    #[test]
    fn total_paid_over_full_schedule_at_least_principal() {
        let result = amortize(&input(Some(360), false));
        assert!(result.total_paid >= 300_000.0);
    }
}
