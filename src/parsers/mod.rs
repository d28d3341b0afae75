pub mod broker;
pub mod csv_parser;
pub mod ofx;

use serde::{Deserialize, Serialize};

/// A single normalized transaction extracted from any source format.
/// Amount sign convention: negative = money leaving the account (withdrawal),
/// positive = deposit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTransaction {
    pub id: Option<String>,
    pub date: String,
    pub name: String,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMeta {
    pub account_id: String,
    pub account_type: String,
    pub institution: String,
    pub balance: Option<f64>,
    pub balance_date: Option<String>,
}

/// One row of a brokerage positions file — not a transaction, a point-in-time
/// holding snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRow {
    pub symbol: String,
    pub description: String,
    pub quantity: f64,
    pub last_price: f64,
    pub current_value: f64,
    pub cost_basis: Option<f64>,
    pub gain_loss: Option<f64>,
}

/// Per-institution CSV column mapping.
#[derive(Debug, Clone)]
pub struct CsvProfile {
    pub date_column: String,
    pub amount_column: String,
    pub description_column: String,
    pub credit_column: Option<String>,
    pub debit_column: Option<String>,
    pub invert_amount: bool,
}

pub enum ParseResult {
    Transactions(AccountMeta, Vec<RawTransaction>),
    Positions(Vec<PositionRow>),
}

/// Tagged dispatch over the four parser kinds.
pub enum Parser {
    Ofx,
    Csv(CsvProfile),
    BrokerPositions,
    BrokerActivity,
}

impl Parser {
    /// Pick a parser from a filename, an optional institution CSV profile,
    /// and whether the upload was flagged as a brokerage positions file or a
    /// brokerage activity file. Never fails — an unrecognized extension
    /// falls back to a generic CSV profile, which itself drops unparseable
    /// rows rather than raising.
    pub fn for_file(filename: &str, profile: Option<CsvProfile>, is_broker_positions: bool, is_broker_activity: bool) -> Parser {
        let lower = filename.to_lowercase();
        if lower.ends_with(".ofx") || lower.ends_with(".qfx") {
            Parser::Ofx
        } else if is_broker_positions {
            Parser::BrokerPositions
        } else if is_broker_activity {
            Parser::BrokerActivity
        } else if let Some(profile) = profile {
            Parser::Csv(profile)
        } else {
            Parser::Csv(CsvProfile {
                date_column: "Date".into(),
                amount_column: "Amount".into(),
                description_column: "Description".into(),
                credit_column: None,
                debit_column: None,
                invert_amount: false,
            })
        }
    }

    pub fn parse(&self, contents: &str) -> ParseResult {
        match self {
            Parser::Ofx => {
                let (meta, txns) = ofx::parse(contents);
                ParseResult::Transactions(meta, txns)
            }
            Parser::Csv(profile) => {
                let (meta, txns) = csv_parser::parse(contents, profile);
                ParseResult::Transactions(meta, txns)
            }
            Parser::BrokerPositions => ParseResult::Positions(broker::parse_positions(contents)),
            Parser::BrokerActivity => {
                ParseResult::Transactions(AccountMeta::default(), broker::parse_activity(contents))
            }
        }
    }
}
