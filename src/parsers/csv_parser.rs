use super::{AccountMeta, CsvProfile, RawTransaction};

/// Parse a CSV export according to an institution profile.
/// A row whose amount fails to parse is dropped; everything else —
/// including an unparsable date — is retained (the date falls back to
/// today's date).
pub fn parse(contents: &str, profile: &CsvProfile) -> (AccountMeta, Vec<RawTransaction>) {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents.as_bytes());

    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(_) => return (AccountMeta::default(), Vec::new()),
    };

    let col = |name: &str| headers.iter().position(|h| h == name);

    let date_idx = col(&profile.date_column);
    let amount_idx = col(&profile.amount_column);
    let desc_idx = col(&profile.description_column);
    let credit_idx = profile.credit_column.as_deref().and_then(col);
    let debit_idx = profile.debit_column.as_deref().and_then(col);

    let mut transactions = Vec::new();

    for record in reader.records().flatten() {
        let amount = match (credit_idx, debit_idx) {
            (Some(c), Some(d)) => {
                let credit = parse_amount(record.get(c).unwrap_or(""));
                let debit = parse_amount(record.get(d).unwrap_or(""));
                match (credit, debit) {
                    (Some(c), Some(d)) => Some(c - d),
                    (Some(c), None) => Some(c),
                    (None, Some(d)) => Some(-d),
                    (None, None) => None,
                }
            }
            _ => amount_idx.and_then(|i| parse_amount(record.get(i).unwrap_or(""))),
        };

        let Some(mut amount) = amount else { continue };
        if !amount.is_finite() {
            continue;
        }
        if profile.invert_amount {
            amount = -amount;
        }

        let date = date_idx
            .and_then(|i| record.get(i))
            .and_then(parse_date)
            .unwrap_or_else(today);

        let name = desc_idx
            .and_then(|i| record.get(i))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        transactions.push(RawTransaction {
            id: None,
            date,
            name,
            amount,
            kind: None,
            memo: None,
        });
    }

    (AccountMeta::default(), transactions)
}

fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn parse_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(raw, "%m-%d-%Y") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    None
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> CsvProfile {
        CsvProfile {
            date_column: "Date".into(),
            amount_column: "Amount".into(),
            description_column: "Description".into(),
            credit_column: None,
            debit_column: None,
            invert_amount: false,
        }
    }

    #[test]
    fn parses_basic_rows() {
        let csv = "Date,Description,Amount\n01/15/2026,COFFEE SHOP,-4.50\n01/16/2026,PAYCHECK,2000.00\n";
        let (_, txns) = parse(csv, &profile());
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].date, "2026-01-15");
        assert_eq!(txns[0].amount, -4.50);
        assert_eq!(txns[1].amount, 2000.00);
    }

    #[test]
    fn strips_currency_formatting_from_amount() {
        let csv = "Date,Description,Amount\n2026-01-15,STORE,\"$1,234.56\"\n";
        let (_, txns) = parse(csv, &profile());
        assert_eq!(txns[0].amount, 1234.56);
    }

    #[test]
    fn unparsable_amount_drops_row_but_bad_date_is_retained() {
        let csv = "Date,Description,Amount\nnot-a-date,STORE,12.00\nbad,STORE,not-a-number\n";
        let (_, txns) = parse(csv, &profile());
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].date.len(), 10); // fell back to today, still YYYY-MM-DD
    }

    #[test]
    fn credit_debit_columns_net_to_signed_amount() {
        let profile = CsvProfile {
            date_column: "Date".into(),
            amount_column: "Amount".into(),
            description_column: "Description".into(),
            credit_column: Some("Credit".into()),
            debit_column: Some("Debit".into()),
            invert_amount: false,
        };
        let csv = "Date,Description,Credit,Debit\n2026-01-01,DEPOSIT,100.00,\n2026-01-02,WITHDRAWAL,,40.00\n";
        let (_, txns) = parse(csv, &profile);
        assert_eq!(txns[0].amount, 100.0);
        assert_eq!(txns[1].amount, -40.0);
    }

    #[test]
    fn invert_amount_negates_value() {
        let mut p = profile();
        p.invert_amount = true;
        let csv = "Date,Description,Amount\n2026-01-01,OUTFLOW,50.00\n";
        let (_, txns) = parse(csv, &p);
        assert_eq!(txns[0].amount, -50.0);
    }
}
