use super::{AccountMeta, RawTransaction};

/// Parse an OFX/QFX file, whether it is XML-well-formed or SGML-style with
/// no closing tags. Extraction is tag-name based, not tree-based: it scans
/// for `<TAG>value` occurrences terminated by a newline or the next tag.
/// Never raises — an empty or malformed input yields zero
/// transactions and a best-effort `AccountMeta`.
pub fn parse(contents: &str) -> (AccountMeta, Vec<RawTransaction>) {
    let meta = AccountMeta {
        account_id: find_tag(contents, "ACCTID").unwrap_or_default(),
        account_type: find_tag(contents, "ACCTTYPE").unwrap_or_default(),
        institution: find_tag(contents, "ORG")
            .or_else(|| find_tag(contents, "FID"))
            .unwrap_or_else(|| "unknown".to_string()),
        balance: find_tag(contents, "BALAMT").and_then(|s| s.parse().ok()),
        balance_date: find_tag(contents, "DTASOF").map(|s| normalize_date(&s)),
    };

    let transactions = split_statement_blocks(contents)
        .iter()
        .filter_map(|block| parse_txn_block(block))
        .collect();

    (meta, transactions)
}

/// Split on `<STMTTRN>` occurrences; each returned slice runs from one
/// `<STMTTRN>` to the next occurrence of `<STMTTRN>` or `</BANKTRANLIST>`,
/// covering both the XML (`</STMTTRN>` present) and SGML (absent) cases.
fn split_statement_blocks(contents: &str) -> Vec<&str> {
    let upper = contents.to_uppercase();
    let starts: Vec<usize> = upper
        .match_indices("<STMTTRN>")
        .map(|(i, _)| i)
        .collect();

    let mut blocks = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = if idx + 1 < starts.len() {
            starts[idx + 1]
        } else {
            upper[start..]
                .find("</BANKTRANLIST>")
                .map(|rel| start + rel)
                .unwrap_or(contents.len())
        };
        blocks.push(&contents[start..end]);
    }
    blocks
}

fn parse_txn_block(block: &str) -> Option<RawTransaction> {
    let amount: f64 = find_tag(block, "TRNAMT")?.trim().parse().ok()?;

    let date = find_tag(block, "DTPOSTED")
        .map(|s| normalize_date(&s))
        .unwrap_or_default();

    let name = find_tag(block, "NAME")
        .or_else(|| find_tag(block, "PAYEE"))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    Some(RawTransaction {
        id: find_tag(block, "FITID"),
        date,
        name,
        amount,
        kind: find_tag(block, "TRNTYPE"),
        memo: find_tag(block, "MEMO"),
    })
}

/// Find the first `<TAG>value` occurrence (case-insensitive tag match) and
/// return `value` trimmed, terminated by a newline, carriage return, or the
/// start of the next tag.
fn find_tag(text: &str, tag: &str) -> Option<String> {
    let needle_open = format!("<{tag}>");
    let upper = text.to_uppercase();
    let idx = upper.find(&needle_open)?;
    let value_start = idx + needle_open.len();
    let rest = &text[value_start..];

    let end = rest
        .find(['\n', '\r', '<'])
        .unwrap_or(rest.len());

    let value = rest[..end].trim();
    if value.is_empty() { None } else { Some(value.to_string()) }
}

/// `YYYYMMDD[HHMMSS][.SSS][TZ]` → `YYYY-MM-DD`. Any input shorter than 8
/// digits is returned unchanged rather than panicking.
fn normalize_date(raw: &str) -> String {
    let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return raw.to_string();
    }
    format!("{}-{}-{}", &digits[0..4], &digits[4..6], &digits[6..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"
OFXHEADER:100
DATA:OFXSGML
VERSION:102

<OFX>
<SIGNONMSGSRSV1>
<SONRS>
<FI>
<ORG>FIRST NATIONAL
<FID>1001
</FI>
</SONRS>
</SIGNONMSGSRSV1>
<BANKMSGSRSV1>
<STMTTRNRS>
<STMTRS>
<BANKACCTFROM>
<ACCTID>0001234567
<ACCTTYPE>CHECKING
</BANKACCTFROM>
<BANKTRANLIST>
<STMTTRN>
<TRNTYPE>DEBIT
<DTPOSTED>20260110120000
<TRNAMT>-45.99
<FITID>2026011000001
<NAME>AMAZON MARKETPLACE
</STMTTRN>
<STMTTRN>
<TRNTYPE>CREDIT
<DTPOSTED>20260111
<TRNAMT>3500.00
<FITID>2026011100001
<NAME>PAYROLL DEPOSIT
</STMTTRN>
<STMTTRN>
<TRNTYPE>DEBIT
<DTPOSTED>20260112
<TRNAMT>-12.50
<FITID>2026011200001
<NAME>COFFEE SHOP
</STMTTRN>
</BANKTRANLIST>
<LEDGERBAL>
<BALAMT>5441.51
<DTASOF>20260112
</LEDGERBAL>
</STMTRS>
</STMTTRNRS>
</BANKMSGSRSV1>
</OFX>
"#;

    #[test]
    fn parses_three_transactions_with_amounts_and_dates() {
        let (meta, txns) = parse(FIXTURE);
        assert_eq!(txns.len(), 3);
        assert_eq!(txns[0].amount, -45.99);
        assert_eq!(txns[0].date, "2026-01-10");
        assert_eq!(txns[0].id.as_deref(), Some("2026011000001"));
        assert!(txns[0].name.contains("AMAZON"));
        assert_eq!(txns[1].amount, 3500.00);
        assert_eq!(txns[2].amount, -12.50);

        assert_eq!(meta.account_id, "0001234567");
        assert_eq!(meta.account_type, "CHECKING");
        assert_eq!(meta.institution, "FIRST NATIONAL");
        assert_eq!(meta.balance, Some(5441.51));
    }

    #[test]
    fn empty_input_yields_zero_transactions_and_never_panics() {
        let (meta, txns) = parse("");
        assert!(txns.is_empty());
        assert_eq!(meta.institution, "unknown");
        assert_eq!(meta.account_id, "");
    }

    #[test]
    fn missing_trnamt_drops_the_transaction() {
        let input = "<STMTTRN><DTPOSTED>20260101<NAME>NO AMOUNT</STMTTRN>";
        let (_, txns) = parse(input);
        assert!(txns.is_empty());
    }

    #[test]
    fn missing_name_falls_back_to_unknown() {
        let input = "<STMTTRN><DTPOSTED>20260101<TRNAMT>-5.00<FITID>x1</STMTTRN>";
        let (_, txns) = parse(input);
        assert_eq!(txns[0].name, "Unknown");
    }

    #[test]
    fn all_produced_transactions_satisfy_invariants() {
        let (_, txns) = parse(FIXTURE);
        for t in &txns {
            assert_eq!(t.date.len(), 10);
            assert!(t.amount.is_finite());
            assert!(!t.name.is_empty());
        }
    }
}
