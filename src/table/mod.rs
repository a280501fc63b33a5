// src/table/mod.rs

pub mod auth;
pub mod memory;
pub mod sheets;

use std::sync::Arc;

use crate::error::Result;

pub use auth::{ServiceAccountKey, ServiceAccountTokens};
pub use memory::{MemoryConnector, MemoryTable};
pub use sheets::{SheetsConnector, SheetsTable};

/// One row of cells as the service returns it. Trailing empty cells may be
/// missing, so rows can be shorter than the header.
pub type Row = Vec<String>;

/// A worksheet-like table: a grid of text cells addressed by 1-based row
/// number. Row 1 is the header. No transactions, no indexes.
pub trait Table: Send + Sync {
    fn title(&self) -> &str;

    /// Cells of row 1, or an empty vec when the table has no header yet.
    fn header(&self) -> Result<Row>;

    /// Every non-empty row, header included, top to bottom.
    fn rows(&self) -> Result<Vec<Row>>;

    /// Overwrite `rows.len()` consecutive rows starting at `start_row`.
    fn write_rows(&self, start_row: usize, rows: &[Row]) -> Result<()>;

    fn write_row(&self, row_number: usize, values: &[String]) -> Result<()> {
        self.write_rows(row_number, &[values.to_vec()])
    }

    /// Add `values` below the last non-empty row.
    fn append_row(&self, values: &[String]) -> Result<()>;

    /// Remove a row; rows below it move up by one.
    fn delete_row(&self, row_number: usize) -> Result<()>;

    /// Empty every cell.
    fn clear(&self) -> Result<()>;
}

/// Acquires a table handle. Expensive: authentication and worksheet lookup
/// or creation happen here, so callers cache the result.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn Table>>;
}

/// Spreadsheet column letter for a 1-based column index (1 → A, 27 → AA).
pub fn column_letter(mut col: usize) -> String {
    let mut out = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        out.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// A1 range covering `width` columns over rows `first..=last`.
pub fn a1_range(first: usize, last: usize, width: usize) -> String {
    format!(
        "A{}:{}{}",
        first,
        column_letter(width.max(1)),
        last
    )
}

/// Worksheet title quoted for use in an A1 reference (`'My sheet'!A1`).
pub fn quote_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}
