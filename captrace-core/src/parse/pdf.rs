use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::parse::{text_tables, Page, ParsedDoc};

/// Parse a PDF byte buffer.
///
/// Primary path extracts the text layer page by page and recovers tables
/// from column alignment. When the primary extractor fails (malformed xref
/// tables are common in generated statements), a whole-document text pass is
/// tried before giving up; that fallback produces a single page and no
/// tables.
pub fn parse(path: &str, bytes: &[u8]) -> Result<ParsedDoc> {
    match extract_pages(bytes) {
        Ok(pages) => {
            let mut doc = assemble(pages);
            doc.metadata
                .insert("parser".into(), "pdf_text_layer".into());
            Ok(doc)
        }
        Err(primary_err) => {
            warn!(path, error = %primary_err, "primary pdf extraction failed; retrying text-only");
            let text = extract_whole(bytes).map_err(|fallback_err| {
                PipelineError::parse(
                    path,
                    format!("pdf extraction failed: {primary_err}; fallback: {fallback_err}"),
                )
            })?;
            let mut metadata = BTreeMap::new();
            metadata.insert("parser".into(), "pdf_text_fallback".into());
            metadata.insert("page_count".into(), "1".into());
            Ok(ParsedDoc {
                pages: vec![Page { no: 1, text }],
                tables: Vec::new(),
                metadata,
            })
        }
    }
}

fn extract_pages(bytes: &[u8]) -> std::result::Result<Vec<String>, String> {
    // pdf-extract can panic on malformed content streams; treat a panic the
    // same as a parse failure so the fallback still runs.
    catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }))
    .map_err(|_| "panic in pdf text extraction".to_string())?
    .map_err(|e| e.to_string())
}

fn extract_whole(bytes: &[u8]) -> std::result::Result<String, String> {
    catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|_| "panic in pdf text extraction".to_string())?
        .map_err(|e| e.to_string())
}

fn assemble(raw_pages: Vec<String>) -> ParsedDoc {
    let mut pages = Vec::with_capacity(raw_pages.len());
    let mut tables = Vec::new();
    for (idx, text) in raw_pages.into_iter().enumerate() {
        let no = idx + 1;
        tables.extend(text_tables::tables_from_text(no, &text));
        pages.push(Page { no, text });
    }
    debug!(pages = pages.len(), tables = tables.len(), "pdf parsed");
    let mut metadata = BTreeMap::new();
    metadata.insert("page_count".into(), pages.len().to_string());
    ParsedDoc {
        pages,
        tables,
        metadata,
    }
}
