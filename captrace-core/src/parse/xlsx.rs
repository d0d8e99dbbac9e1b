use std::collections::BTreeMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::parse::{Page, ParsedDoc, Table};

/// Rows included verbatim in the derived text representation.
const TEXT_ROW_PREVIEW: usize = 20;

/// Parse an XLSX/XLS workbook. Every sheet becomes one [`Table`] keyed by
/// its 1-based sheet index; the derived text concatenates sheet names,
/// headers, a row preview, and a describe-style numeric summary so the
/// classifier and anchor extractor see label text even for purely tabular
/// workbooks.
pub fn parse(path: &str, bytes: &[u8]) -> Result<ParsedDoc> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor)
        .map_err(|e| PipelineError::parse(path, format!("cannot open workbook: {e}")))?;

    let names = workbook.sheet_names().to_owned();
    let mut pages = Vec::new();
    let mut tables = Vec::new();

    for (idx, name) in names.iter().enumerate() {
        let sheet_no = idx + 1;
        let range = workbook
            .worksheet_range(name)
            .map_err(|e| PipelineError::parse(path, format!("sheet {name:?}: {e}")))?;

        let mut rows_iter = range.rows();
        let headers: Vec<String> = rows_iter
            .next()
            .map(|row| row.iter().map(cell_to_string).collect())
            .unwrap_or_default();
        let rows: Vec<Vec<String>> = rows_iter
            .map(|row| row.iter().map(cell_to_string).collect())
            .collect();

        pages.push(Page {
            no: sheet_no,
            text: sheet_text(name, &headers, &rows),
        });
        tables.push(Table {
            page: sheet_no,
            headers,
            rows,
        });
    }

    debug!(path, sheets = tables.len(), "workbook parsed");
    let mut metadata = BTreeMap::new();
    metadata.insert("parser".into(), "workbook".into());
    metadata.insert("sheet_count".into(), tables.len().to_string());
    Ok(ParsedDoc {
        pages,
        tables,
        metadata,
    })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => format_number(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR:{e:?}"),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

fn format_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

fn sheet_text(name: &str, headers: &[String], rows: &[Vec<String>]) -> String {
    let mut out = format!("Sheet: {name}\n");
    out.push_str(&headers.join(" | "));
    out.push('\n');
    for row in rows.iter().take(TEXT_ROW_PREVIEW) {
        out.push_str(&row.join(" | "));
        out.push('\n');
    }
    out.push_str(&numeric_summary(headers, rows));
    out
}

/// Per-column count/min/max/mean over the numeric cells.
fn numeric_summary(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    for (col, header) in headers.iter().enumerate() {
        let values: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(col))
            .filter_map(|cell| cell.replace(',', "").parse::<f64>().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        let count = values.len();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / count as f64;
        out.push_str(&format!(
            "{header}: count={count} min={min} max={max} mean={mean:.2}\n"
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_fail_as_parse_error() {
        let err = parse("/x/book.xlsx", b"definitely not a zip").unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[test]
    fn integral_floats_render_without_fraction() {
        assert_eq!(format_number(5_000_000.0), "5000000");
        assert_eq!(format_number(0.25), "0.25");
    }

    #[test]
    fn numeric_summary_skips_text_columns() {
        let headers = vec!["Fund".to_string(), "NAV".to_string()];
        let rows = vec![
            vec!["Alpha".to_string(), "100".to_string()],
            vec!["Beta".to_string(), "300".to_string()],
        ];
        let summary = numeric_summary(&headers, &rows);
        assert!(summary.contains("NAV: count=2 min=100 max=300 mean=200.00"));
        assert!(!summary.contains("Fund:"));
    }
}
