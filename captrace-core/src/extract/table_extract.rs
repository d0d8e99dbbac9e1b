//! Table-structure extraction: label/value alignment against the catalog.

use captrace_model::ExtractorTag;
use tracing::trace;

use crate::extract::anchors::parse_value;
use crate::extract::catalog::{FieldKind, FieldSpec};
use crate::extract::{Candidate, FieldValue};
use crate::parse::Table;

/// Base confidence for a table hit.
const TABLE_BASE: f64 = 0.85;
/// Bonus when the row label is a catalog alias verbatim.
const EXACT_ALIAS_BONUS: f64 = 0.05;

fn normalize_label(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

enum LabelMatch {
    Exact,
    Partial,
}

/// Short generic aliases ("fund", "nav") only count when the label matches
/// them exactly; substring hits on them misfire on rows like "Alpha Fund".
const MIN_PARTIAL_ALIAS_LEN: usize = 8;

fn match_label(spec: &FieldSpec, label: &str) -> Option<LabelMatch> {
    let normalized = normalize_label(label);
    if normalized.is_empty() {
        return None;
    }
    for alias in spec.aliases {
        let alias_norm = normalize_label(alias);
        if normalized == alias_norm {
            return Some(LabelMatch::Exact);
        }
        if alias_norm.len() >= MIN_PARTIAL_ALIAS_LEN && normalized.contains(&alias_norm) {
            return Some(LabelMatch::Partial);
        }
    }
    None
}

/// Pull values out of tables, in two shapes:
/// - row-label tables (`Ending Balance | 40,700,000`): the first cell names
///   the field, a later cell in the same row holds the value;
/// - header-column tables (`Fund | NAV | ...`): a header cell names the
///   field, the aligned cell of the first data row holds the value.
pub fn extract(catalog: &'static [FieldSpec], tables: &[Table]) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = Vec::new();
    for spec in catalog {
        if let Some(candidate) = find_in_tables(spec, tables) {
            trace!(field = candidate.field, raw = %candidate.raw, "table hit");
            out.push(candidate);
        }
    }
    out
}

fn find_in_tables(spec: &'static FieldSpec, tables: &[Table]) -> Option<Candidate> {
    for table in tables {
        // Row-label shape first: it is how statements lay out balances.
        for row in &table.rows {
            let Some(label) = row.first() else { continue };
            let Some(hit) = match_label(spec, label) else {
                continue;
            };
            if let Some((raw, value)) = row_value(spec.kind, &row[1..]) {
                return Some(candidate(spec, raw, value, hit));
            }
        }
        // Header-column shape: value sits under the matching header.
        for (col, header) in table.headers.iter().enumerate() {
            let Some(hit) = match_label(spec, header) else {
                continue;
            };
            for row in &table.rows {
                let Some(cell) = row.get(col) else { continue };
                if let Some(value) = parse_value(spec.kind, cell) {
                    return Some(candidate(spec, cell.clone(), value, hit));
                }
            }
        }
    }
    None
}

/// Rightmost parsable cell wins for numbers (totals columns sit right),
/// leftmost for everything else.
fn row_value(kind: FieldKind, cells: &[String]) -> Option<(String, FieldValue)> {
    let parsed = |cell: &String| parse_value(kind, cell).map(|v| (cell.clone(), v));
    match kind {
        FieldKind::Money | FieldKind::Percent | FieldKind::Multiple => {
            cells.iter().rev().find_map(parsed)
        }
        FieldKind::Date | FieldKind::Text => cells.iter().find_map(parsed),
    }
}

fn candidate(
    spec: &'static FieldSpec,
    raw: String,
    value: FieldValue,
    hit: LabelMatch,
) -> Candidate {
    let confidence = match hit {
        LabelMatch::Exact => TABLE_BASE + EXACT_ALIAS_BONUS,
        LabelMatch::Partial => TABLE_BASE,
    };
    Candidate {
        field: spec.name,
        raw,
        value,
        tag: ExtractorTag::Table,
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::catalog::catalog_for;
    use captrace_model::DocType;

    fn statement_table() -> Table {
        Table {
            page: 1,
            headers: vec!["Item".into(), "Amount (EUR)".into()],
            rows: vec![
                vec!["Beginning Balance".into(), "35,000,000.00".into()],
                vec!["Capital Contributions".into(), "5,000,000.00".into()],
                vec!["Ending Balance".into(), "40,700,000.00".into()],
            ],
        }
    }

    #[test]
    fn row_label_tables_resolve_amounts() {
        let candidates = extract(
            catalog_for(DocType::CapitalAccountStatement),
            &[statement_table()],
        );
        let ending = candidates
            .iter()
            .find(|c| c.field == "ending_balance")
            .unwrap();
        assert_eq!(ending.value, FieldValue::Money(40_700_000.0));
        assert_eq!(ending.tag, ExtractorTag::Table);
        // "Ending Balance" is an exact catalog alias.
        assert!((ending.confidence - 0.90).abs() < 1e-9);
    }

    #[test]
    fn partial_label_match_gets_base_confidence() {
        let table = Table {
            page: 1,
            headers: vec![],
            rows: vec![vec![
                "Total Management Fees for the Period".into(),
                "250,000".into(),
            ]],
        };
        let candidates = extract(catalog_for(DocType::CapitalAccountStatement), &[table]);
        let fees = candidates
            .iter()
            .find(|c| c.field == "management_fees_period")
            .unwrap();
        assert!((fees.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn header_column_tables_resolve_too() {
        let table = Table {
            page: 1,
            headers: vec!["Fund".into(), "Net Asset Value".into()],
            rows: vec![vec!["Alpha Fund".into(), "10,200,000".into()]],
        };
        let candidates = extract(catalog_for(DocType::QuarterlyReport), &[table]);
        let nav = candidates.iter().find(|c| c.field == "fund_nav").unwrap();
        assert_eq!(nav.value, FieldValue::Money(10_200_000.0));
    }

    #[test]
    fn rightmost_numeric_cell_wins_for_money() {
        let table = Table {
            page: 1,
            headers: vec![],
            rows: vec![vec![
                "Ending Balance".into(),
                "note 4".into(),
                "1,000".into(),
                "2,000".into(),
            ]],
        };
        let candidates = extract(catalog_for(DocType::CapitalAccountStatement), &[table]);
        let ending = candidates
            .iter()
            .find(|c| c.field == "ending_balance")
            .unwrap();
        assert_eq!(ending.value, FieldValue::Money(2000.0));
    }
}
