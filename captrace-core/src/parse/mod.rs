//! File parsing: raw bytes to a [`ParsedDoc`] of text pages and tables.
//!
//! Parsers are synchronous (the pipeline wraps them in `spawn_blocking`) and
//! operate on byte buffers so the in-memory test filesystem can feed them
//! directly. Byte-level encoding problems never leave this module: they
//! surface as `Encoding` errors and fail the work item at the Parsing stage.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

mod csv_file;
mod pdf;
mod text_tables;
mod xlsx;

pub use text_tables::tables_from_text;

/// One page of extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-based page number.
    pub no: usize,
    pub text: String,
}

/// A rectangular table found in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// 1-based page (or sheet) the table came from.
    pub page: usize,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Structured parse result handed to classification and extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDoc {
    pub pages: Vec<Page>,
    pub tables: Vec<Table>,
    pub metadata: BTreeMap<String, String>,
}

impl ParsedDoc {
    /// Concatenated text of the first `n` pages, used by classification.
    pub fn head_text(&self, n: usize) -> String {
        self.pages
            .iter()
            .take(n)
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All text, page-joined.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse `bytes` according to the file extension of `path`.
pub fn parse_file(path: &Path, bytes: &[u8]) -> Result<ParsedDoc> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let display = path.display().to_string();

    match ext.as_str() {
        "pdf" => pdf::parse(&display, bytes),
        "xlsx" | "xls" => xlsx::parse(&display, bytes),
        "csv" => csv_file::parse(&display, bytes),
        other => Err(PipelineError::parse(
            display,
            format!("unsupported extension {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_text_takes_first_pages() {
        let doc = ParsedDoc {
            pages: vec![
                Page { no: 1, text: "one".into() },
                Page { no: 2, text: "two".into() },
                Page { no: 3, text: "three".into() },
            ],
            tables: vec![],
            metadata: BTreeMap::new(),
        };
        assert_eq!(doc.head_text(2), "one\ntwo");
        assert_eq!(doc.full_text(), "one\ntwo\nthree");
    }

    #[test]
    fn unknown_extension_is_a_parse_error() {
        let err = parse_file(Path::new("/x/notes.txt"), b"hello").unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }
}
