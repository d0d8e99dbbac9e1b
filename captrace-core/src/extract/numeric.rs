//! Locale-aware numeric parsing for monetary values, percentages, and
//! multiples.

use once_cell::sync::Lazy;
use regex::Regex;

static CURRENCY_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(EUR|USD|GBP|CHF|JPY|SEK|NOK|DKK)\b|[€$£¥]").expect("valid regex")
});

/// Grouping shape like `1,234` / `12,345,678` (or the same with dots).
fn is_grouping_pattern(digits: &str, sep: char) -> bool {
    let mut parts = digits.split(sep);
    let Some(first) = parts.next() else {
        return false;
    };
    if first.is_empty() || first.len() > 3 || !first.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let mut saw_group = false;
    for part in parts {
        if part.len() != 3 || !part.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        saw_group = true;
    }
    saw_group
}

/// Parse a monetary amount.
///
/// Disambiguation rules:
/// - both `,` and `.` present: the rightmost separator is the decimal point,
///   the other is grouping;
/// - a single separator sitting in a three-digit grouping pattern is a
///   thousands separator;
/// - otherwise a single separator is the decimal point.
///
/// Parentheses mean negative, currency symbols and codes are noise.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let mut s = CURRENCY_NOISE.replace_all(raw, "").trim().to_string();
    if s.is_empty() {
        return None;
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].trim().to_string();
    }
    if let Some(stripped) = s.strip_prefix('-') {
        negative = !negative;
        s = stripped.trim().to_string();
    }
    s.retain(|c| !c.is_whitespace() && c != '\u{a0}' && c != '\'');
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '.') {
        return None;
    }

    let has_comma = s.contains(',');
    let has_dot = s.contains('.');

    let normalized = match (has_comma, has_dot) {
        (true, true) => {
            let decimal = if s.rfind(',') > s.rfind('.') { ',' } else { '.' };
            let grouping = if decimal == ',' { '.' } else { ',' };
            let cleaned = s.replace(grouping, "");
            cleaned.replace(decimal, ".")
        }
        (true, false) => {
            if is_grouping_pattern(&s, ',') {
                s.replace(',', "")
            } else {
                s.replace(',', ".")
            }
        }
        (false, true) => {
            if is_grouping_pattern(&s, '.') {
                s.replace('.', "")
            } else {
                s
            }
        }
        (false, false) => s,
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Parse a percentage into a fraction. `"12.5%"` and `"12.5"` both come out
/// as 0.125; values at or below 1.0 are taken as already-fractional.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let had_sign = raw.contains('%');
    let cleaned = raw.replace('%', "");
    let value = parse_amount(&cleaned)?;
    if had_sign || value.abs() > 1.0 {
        Some(value / 100.0)
    } else {
        Some(value)
    }
}

/// Parse a multiple like `"1.45x"` or `"1,45"`.
pub fn parse_multiple(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().trim_end_matches(['x', 'X']).trim();
    parse_amount(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_boundary_cases() {
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("1234"), Some(1234.0));
    }

    #[test]
    fn grouping_only_separators_strip() {
        assert_eq!(parse_amount("1,234"), Some(1234.0));
        assert_eq!(parse_amount("12,345,678"), Some(12_345_678.0));
        assert_eq!(parse_amount("1.234"), Some(1234.0));
        assert_eq!(parse_amount("5.000.000"), Some(5_000_000.0));
    }

    #[test]
    fn single_separator_decimal_when_not_grouping() {
        assert_eq!(parse_amount("10,5"), Some(10.5));
        assert_eq!(parse_amount("10.5"), Some(10.5));
        assert_eq!(parse_amount("1234,56"), Some(1234.56));
    }

    #[test]
    fn currency_noise_and_sign_conventions() {
        assert_eq!(parse_amount("EUR 40.700.000,00"), Some(40_700_000.0));
        assert_eq!(parse_amount("$ 1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("(250,000.00)"), Some(-250_000.0));
        assert_eq!(parse_amount("-1.000,25"), Some(-1000.25));
        assert_eq!(parse_amount("€1 234 567,89"), Some(1_234_567.89));
    }

    #[test]
    fn rejects_non_numeric_text() {
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("EUR"), None);
    }

    #[test]
    fn percent_normalizes_to_fraction() {
        assert_eq!(parse_percent("12.5%"), Some(0.125));
        assert_eq!(parse_percent("12.5"), Some(0.125));
        assert_eq!(parse_percent("0.125"), Some(0.125));
    }

    #[test]
    fn multiple_strips_suffix() {
        assert_eq!(parse_multiple("1.45x"), Some(1.45));
        assert_eq!(parse_multiple("1,45"), Some(1.45));
    }
}
