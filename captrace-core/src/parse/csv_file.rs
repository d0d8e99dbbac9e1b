use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::parse::{Page, ParsedDoc, Table};

/// Parse a CSV byte buffer.
///
/// Decoding tries a fixed encoding sequence: strict UTF-8 first, then
/// Latin-1 (rejected when C1 control bytes appear, which in practice means
/// the file is CP-1252), then CP-1252. The first successful decode wins;
/// exhausting the sequence is an `Encoding` failure, which is terminal for
/// the work item.
pub fn parse(path: &str, bytes: &[u8]) -> Result<ParsedDoc> {
    let (text, encoding) = decode(bytes)
        .ok_or_else(|| PipelineError::encoding(path, "no encoding in the fallback chain fits"))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| PipelineError::parse(path, format!("csv record: {e}")))?;
        records.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    if records.is_empty() {
        return Err(PipelineError::parse(path, "csv file has no rows"));
    }

    let headers = records.remove(0);
    debug!(path, rows = records.len(), encoding, "csv parsed");

    let mut metadata = BTreeMap::new();
    metadata.insert("parser".into(), "csv".into());
    metadata.insert("encoding".into(), encoding.to_string());
    metadata.insert("row_count".into(), records.len().to_string());

    Ok(ParsedDoc {
        pages: vec![Page { no: 1, text }],
        tables: vec![Table {
            page: 1,
            headers,
            rows: records,
        }],
        metadata,
    })
}

/// {UTF-8, Latin-1, CP-1252}, first success wins.
fn decode(bytes: &[u8]) -> Option<(String, &'static str)> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some((text.to_string(), "utf-8"));
    }
    if let Some(text) = decode_latin1_strict(bytes) {
        return Some((text, "latin-1"));
    }
    let (text, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
    if !had_errors {
        return Some((text.into_owned(), "cp1252"));
    }
    None
}

/// Latin-1 maps every byte, so a naive decode can never fail. Bytes in the
/// C1 control range (0x80..=0x9F) are not printable Latin-1 text though;
/// treating them as a miss lets genuinely CP-1252 files (where that range
/// holds characters like the euro sign) fall through to the CP-1252 step.
fn decode_latin1_strict(bytes: &[u8]) -> Option<String> {
    if bytes.iter().any(|b| (0x80..=0x9F).contains(b)) {
        return None;
    }
    Some(bytes.iter().map(|&b| b as char).collect())
}
