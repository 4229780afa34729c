//! Locale-aware parsing of price text into integer minor units

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Currency assumed when the text carries neither a symbol nor an ISO code.
pub const DEFAULT_CURRENCY: &str = "USD";

/// Known symbols, longest first so `A$` wins over `$` at the same position.
const SYMBOLS: &[(&str, &str)] = &[
    ("A$", "AUD"),
    ("C$", "CAD"),
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("₽", "RUB"),
    ("₩", "KRW"),
    ("฿", "THB"),
];

/// ISO 4217 codes honoured when written out in the text.
const ISO_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "INR", "RUB", "KRW", "THB", "AUD", "CAD", "CHF", "CNY", "HKD",
    "SGD", "NZD", "SEK", "NOK", "DKK", "PLN", "CZK", "HUF", "BRL", "MXN", "ZAR", "TRY",
];

/// Codes that are also ordinary English words; only honoured in uppercase.
const WORD_CODES: &[&str] = &["TRY"];

static ISO_CODE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\b(?:{})\b", ISO_CODES.join("|"))).ok());

static NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[.,]?\d[\d.,]*").ok());

/// An amount in minor currency units with its ISO 4217 code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub cents: i64,
    pub currency: String,
}

impl Money {
    pub fn new(cents: i64, currency: impl Into<String>) -> Self {
        Self {
            cents,
            currency: currency.into(),
        }
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.cents / 100,
            (self.cents % 100).abs(),
            self.currency
        )
    }
}

/// Parse free-form price text such as `"$19.99"` or `"€1.234,56"`.
///
/// Returns `None` when the text holds no parsable number; callers treat that
/// as "no price extracted".
pub fn parse_price(text: &str) -> Option<Money> {
    let currency = explicit_code(text)
        .or_else(|| symbol_currency(text))
        .unwrap_or(DEFAULT_CURRENCY)
        .to_string();

    let raw = NUMBER.as_ref()?.find(text)?.as_str();
    let raw = raw.trim_end_matches(['.', ',']);

    let value: f64 = normalize_separators(raw).parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    // Round rather than truncate: 19.99 * 100 is 1998.9999…
    #[allow(clippy::cast_possible_truncation)]
    let cents = (value * 100.0).round() as i64;

    Some(Money { cents, currency })
}

/// First symbol occurring in the text, scanning left to right.
fn symbol_currency(text: &str) -> Option<&'static str> {
    text.char_indices().find_map(|(i, _)| {
        let rest = &text[i..];
        SYMBOLS
            .iter()
            .find(|(symbol, _)| rest.starts_with(symbol))
            .map(|(_, code)| *code)
    })
}

fn explicit_code(text: &str) -> Option<&'static str> {
    ISO_CODE.as_ref()?.find_iter(text).find_map(|found| {
        let found = found.as_str();
        ISO_CODES
            .iter()
            .copied()
            .find(|code| code.eq_ignore_ascii_case(found))
            .filter(|code| !WORD_CODES.contains(code) || *code == found)
    })
}

/// A comma after the last period marks a decimal comma (`1.234,56`);
/// otherwise the period is decimal and commas group thousands (`1,234.56`).
fn normalize_separators(raw: &str) -> String {
    let last_comma = raw.rfind(',');
    let last_period = raw.rfind('.');

    let comma_is_decimal = match (last_comma, last_period) {
        (Some(comma), Some(period)) => comma > period,
        (Some(_), None) => true,
        _ => false,
    };

    if comma_is_decimal {
        raw.replace('.', "").replace(',', ".")
    } else {
        raw.replace(',', "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(text: &str) -> (i64, String) {
        let money = parse_price(text).unwrap();
        (money.cents, money.currency)
    }

    #[test]
    fn parses_common_formats() {
        assert_eq!(parsed("$19.99"), (1999, "USD".to_string()));
        assert_eq!(parsed("€1.234,56"), (123_456, "EUR".to_string()));
        assert_eq!(parsed("£1,234.56"), (123_456, "GBP".to_string()));
        assert_eq!(parsed("Now only 19,99 €"), (1999, "EUR".to_string()));
    }

    #[test]
    fn recognizes_every_symbol() {
        let cases = [
            ("$5.00", "USD"),
            ("€5.00", "EUR"),
            ("£5.00", "GBP"),
            ("¥5.00", "JPY"),
            ("₹5.00", "INR"),
            ("₽5.00", "RUB"),
            ("₩5.00", "KRW"),
            ("฿5.00", "THB"),
            ("A$5.00", "AUD"),
            ("C$5.00", "CAD"),
        ];

        for (text, code) in cases {
            assert_eq!(parsed(text), (500, code.to_string()), "{text}");
        }
    }

    #[test]
    fn explicit_code_overrides_symbol() {
        assert_eq!(parsed("$25.00 cad"), (2500, "CAD".to_string()));
        assert_eq!(parsed("CHF 12.50"), (1250, "CHF".to_string()));
    }

    #[test]
    fn code_must_be_a_whole_word() {
        assert_eq!(parsed("USDX 3.00"), (300, "USD".to_string()));
        assert_eq!(parsed("Europe 3.00 £"), (300, "GBP".to_string()));
    }

    #[test]
    fn word_codes_need_uppercase() {
        assert_eq!(parsed("Try it today for $5.00"), (500, "USD".to_string()));
        assert_eq!(parsed("try 5.00"), (500, "USD".to_string()));
        assert_eq!(parsed("TRY 45.90"), (4590, "TRY".to_string()));
    }

    #[test]
    fn defaults_to_usd() {
        assert_eq!(parsed("42.10"), (4210, "USD".to_string()));
    }

    #[test]
    fn rounds_instead_of_truncating() {
        assert_eq!(parsed("$19.999").0, 2000);
        assert_eq!(parsed("$0.29").0, 29);
    }

    #[test]
    fn no_digits_is_none() {
        assert_eq!(parse_price("Out of stock"), None);
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("$"), None);
    }

    #[test]
    fn malformed_numbers_are_none() {
        assert_eq!(parse_price("1.2.3"), None);
    }

    #[test]
    fn ignores_trailing_separators() {
        assert_eq!(parsed("Price: $19.99."), (1999, "USD".to_string()));
    }

    #[test]
    fn display_formats_minor_units() {
        assert_eq!(Money::new(123_456, "EUR").to_string(), "1234.56 EUR");
        assert_eq!(Money::new(5, "USD").to_string(), "0.05 USD");
    }
}
