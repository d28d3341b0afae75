use super::{PositionRow, RawTransaction};

/// Parse a brokerage positions export. Skips preamble rows —
/// real exports prepend account summary lines before the actual table — by
/// scanning for the first line that contains both "Symbol" and "Quantity".
pub fn parse_positions(contents: &str) -> Vec<PositionRow> {
    let lines: Vec<&str> = contents.lines().collect();
    let Some(header_idx) = lines
        .iter()
        .position(|line| line.contains("Symbol") && line.contains("Quantity"))
    else {
        return Vec::new();
    };

    let table = lines[header_idx..].join("\n");
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(table.as_bytes());
    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(_) => return Vec::new(),
    };

    let col = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    let symbol_i = col("Symbol");
    let desc_i = col("Description");
    let qty_i = col("Quantity");
    let price_i = col("Last Price");
    let value_i = col("Current Value");
    let cost_i = col("Cost Basis");
    let gain_i = col("Gain/Loss");

    let mut rows = Vec::new();
    for record in reader.records().flatten() {
        let symbol = symbol_i.and_then(|i| record.get(i)).unwrap_or("").trim();
        if symbol.is_empty() || symbol == "--" || symbol.eq_ignore_ascii_case("Symbol") {
            continue;
        }

        rows.push(PositionRow {
            symbol: symbol.to_string(),
            description: desc_i.and_then(|i| record.get(i)).unwrap_or("").trim().to_string(),
            quantity: qty_i.and_then(|i| record.get(i)).and_then(parse_money).unwrap_or(0.0),
            last_price: price_i.and_then(|i| record.get(i)).and_then(parse_money).unwrap_or(0.0),
            current_value: value_i.and_then(|i| record.get(i)).and_then(parse_money).unwrap_or(0.0),
            cost_basis: cost_i.and_then(|i| record.get(i)).and_then(parse_money),
            gain_loss: gain_i.and_then(|i| record.get(i)).and_then(parse_money),
        });
    }

    rows
}

/// Parse a brokerage activity export: `Date`|`Settlement Date`,
/// `Description`|`Action`, `Amount`. Rows missing either a date or an amount
/// are dropped.
pub fn parse_activity(contents: &str) -> Vec<RawTransaction> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(contents.as_bytes());
    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(_) => return Vec::new(),
    };

    let col = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    let date_i = col("Date").or_else(|| col("Settlement Date"));
    let desc_i = col("Description").or_else(|| col("Action"));
    let amount_i = col("Amount");

    let mut transactions = Vec::new();
    for record in reader.records().flatten() {
        let date = date_i.and_then(|i| record.get(i)).map(str::trim).filter(|s| !s.is_empty());
        let amount = amount_i.and_then(|i| record.get(i)).and_then(parse_money);

        let (Some(date), Some(amount)) = (date, amount) else { continue };

        transactions.push(RawTransaction {
            id: None,
            date: date.to_string(),
            name: desc_i
                .and_then(|i| record.get(i))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            amount,
            kind: None,
            memo: None,
        });
    }

    transactions
}

fn parse_money(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-').collect();
    if cleaned.is_empty() { None } else { cleaned.parse::<f64>().ok() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_preamble_and_placeholder_symbols() {
        let csv = "Account Summary for XXX1234\nAs of 01/01/2026\n\nSymbol,Description,Quantity,Last Price,Current Value,Cost Basis,Gain/Loss\nAAPL,Apple Inc,10,190.50,1905.00,1500.00,405.00\n--,Cash & Cash Investments,,,500.00,,\nSymbol,Description,Quantity,Last Price,Current Value,Cost Basis,Gain/Loss\n";
        let rows = parse_positions(csv);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "AAPL");
        assert_eq!(rows[0].current_value, 1905.00);
    }

    #[test]
    fn activity_drops_rows_missing_date_or_amount() {
        let csv = "Date,Action,Amount\n01/02/2026,Dividend,12.34\n,Buy,\n01/03/2026,Interest,\n";
        let txns = parse_activity(csv);
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].amount, 12.34);
    }
}
