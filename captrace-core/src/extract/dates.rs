//! Date parsing for extracted values and the filename fallback.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use captrace_model::facts::last_day_of_month;

const TEXT_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%B %d, %Y",
    "%d %B %Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%Y/%m/%d",
];

/// Parse a date string in any of the accepted formats.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    for format in TEXT_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, format) {
            return Some(date);
        }
    }
    None
}

// Filenames separate tokens with underscores, which are word characters, so
// `\b` boundaries never fire there; explicit non-alphanumeric guards do.
static QUARTER_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])(Q([1-4])[\s._-]*((?:19|20)\d{2}))(?:[^0-9]|$)")
        .expect("valid regex")
});
static YEAR_QUARTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])(((?:19|20)\d{2})[\s._-]*Q([1-4]))(?:[^0-9]|$)")
        .expect("valid regex")
});
static ISO_IN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^0-9])(((?:19|20)\d{2})-(\d{2})-(\d{2}))(?:[^0-9]|$)")
        .expect("valid regex")
});
static DOTTED_IN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^0-9])((\d{2})\.(\d{2})\.((?:19|20)\d{2}))(?:[^0-9]|$)")
        .expect("valid regex")
});
static FISCAL_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[^a-z0-9])((?:FY|YE)[\s._-]?((?:19|20)\d{2}))(?:[^0-9]|$)")
        .expect("valid regex")
});

/// Quarter number to its month-end date.
fn quarter_end(year: i32, quarter: u32) -> NaiveDate {
    last_day_of_month(year, quarter * 3)
}

/// Recover a reporting date from filename tokens (`Q2 2025`, `2024Q3`,
/// `2023-12-31`, `31.12.2023`, `FY2023`). Returns the date and the token
/// that produced it, for the audit trail.
pub fn date_from_filename(filename: &str) -> Option<(NaiveDate, String)> {
    if let Some(caps) = QUARTER_YEAR.captures(filename) {
        let quarter: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        return Some((quarter_end(year, quarter), caps[1].to_string()));
    }
    if let Some(caps) = YEAR_QUARTER.captures(filename) {
        let year: i32 = caps[2].parse().ok()?;
        let quarter: u32 = caps[3].parse().ok()?;
        return Some((quarter_end(year, quarter), caps[1].to_string()));
    }
    if let Some(caps) = ISO_IN_NAME.captures(filename) {
        let date = NaiveDate::from_ymd_opt(
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
            caps[4].parse().ok()?,
        )?;
        return Some((date, caps[1].to_string()));
    }
    if let Some(caps) = DOTTED_IN_NAME.captures(filename) {
        let date = NaiveDate::from_ymd_opt(
            caps[4].parse().ok()?,
            caps[3].parse().ok()?,
            caps[2].parse().ok()?,
        )?;
        return Some((date, caps[1].to_string()));
    }
    if let Some(caps) = FISCAL_YEAR.captures(filename) {
        let year: i32 = caps[2].parse().ok()?;
        return Some((
            NaiveDate::from_ymd_opt(year, 12, 31)?,
            caps[1].to_string(),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn accepts_common_formats() {
        assert_eq!(parse_date("2023-12-31"), Some(d(2023, 12, 31)));
        assert_eq!(parse_date("31.12.2023"), Some(d(2023, 12, 31)));
        assert_eq!(parse_date("December 31, 2023"), Some(d(2023, 12, 31)));
        assert_eq!(parse_date("31 December 2023"), Some(d(2023, 12, 31)));
        assert_eq!(parse_date("31-Dec-2023"), Some(d(2023, 12, 31)));
        assert_eq!(parse_date(" 2024/03/31 "), Some(d(2024, 3, 31)));
    }

    #[test]
    fn day_first_wins_for_slash_dates() {
        // 05/04/2024: European day-first reading.
        assert_eq!(parse_date("05/04/2024"), Some(d(2024, 4, 5)));
        // Month-first only applies when day-first is impossible.
        assert_eq!(parse_date("12/25/2023"), Some(d(2023, 12, 25)));
    }

    #[test]
    fn quarter_tokens_map_to_month_end() {
        assert_eq!(
            date_from_filename("Fund_X_Q2 2025_Statement.pdf"),
            Some((d(2025, 6, 30), "Q2 2025".to_string()))
        );
        assert_eq!(
            date_from_filename("report_2024Q3.pdf").map(|(date, _)| date),
            Some(d(2024, 9, 30))
        );
        assert_eq!(
            date_from_filename("cas_Q4-2023.xlsx").map(|(date, _)| date),
            Some(d(2023, 12, 31))
        );
    }

    #[test]
    fn explicit_dates_in_names_win_over_nothing() {
        assert_eq!(
            date_from_filename("statement_2023-12-31.pdf").map(|(date, _)| date),
            Some(d(2023, 12, 31))
        );
        assert_eq!(
            date_from_filename("auszug_31.12.2023.pdf").map(|(date, _)| date),
            Some(d(2023, 12, 31))
        );
        assert_eq!(
            date_from_filename("FY2023_report.pdf").map(|(date, _)| date),
            Some(d(2023, 12, 31))
        );
        assert_eq!(date_from_filename("plain_name.pdf"), None);
    }
}
