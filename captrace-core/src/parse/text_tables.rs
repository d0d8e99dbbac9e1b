//! Table recovery from layout-preserved text.
//!
//! PDF statements render tabular data as runs of spaces between columns.
//! Lines that split into two or more cells on 2+ space gaps are treated as
//! table rows; consecutive such lines form one table whose first row is the
//! header.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::parse::Table;

static CELL_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}|\t+").expect("valid regex"));

/// Minimum consecutive candidate lines before a block counts as a table.
const MIN_TABLE_ROWS: usize = 2;

fn split_cells(line: &str) -> Vec<String> {
    CELL_SPLIT
        .split(line.trim())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Scan one page of text for column-aligned blocks.
pub fn tables_from_text(page_no: usize, text: &str) -> Vec<Table> {
    let mut tables = Vec::new();
    let mut block: Vec<Vec<String>> = Vec::new();

    let mut flush = |block: &mut Vec<Vec<String>>| {
        if block.len() >= MIN_TABLE_ROWS {
            let headers = block.remove(0);
            tables.push(Table {
                page: page_no,
                headers,
                rows: std::mem::take(block),
            });
        } else {
            block.clear();
        }
    };

    for line in text.lines() {
        let cells = split_cells(line);
        if cells.len() >= 2 {
            block.push(cells);
        } else {
            flush(&mut block);
        }
    }
    flush(&mut block);
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_block_becomes_table() {
        let text = "\
Capital Account Statement

Item                        Amount
Beginning Balance           35,000,000
Ending Balance              40,700,000

closing remarks here";
        let tables = tables_from_text(1, text);
        assert_eq!(tables.len(), 1);
        let t = &tables[0];
        assert_eq!(t.headers, vec!["Item", "Amount"]);
        assert_eq!(t.rows.len(), 2);
        assert_eq!(t.rows[0], vec!["Beginning Balance", "35,000,000"]);
    }

    #[test]
    fn single_aligned_line_is_not_a_table() {
        let tables = tables_from_text(1, "Only one    aligned line\nprose follows");
        assert!(tables.is_empty());
    }

    #[test]
    fn tab_separated_lines_split_too() {
        let text = "Fund\tNAV\nAlpha Fund I\t10,000,000\nBeta Fund II\t5,500,000";
        let tables = tables_from_text(2, text);
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].page, 2);
        assert_eq!(tables[0].rows.len(), 2);
    }
}
