// src/table/memory.rs

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use super::{Connector, Row, Table};
use crate::error::{Result, StoreError};

/// Table kept in process memory. Behaves like a worksheet (trailing empty
/// cells trimmed on read, rows shift up on delete) and can be told to fail
/// upcoming calls, which is how the store's retry paths get exercised.
#[derive(Debug, Default)]
pub struct MemoryTable {
    title: String,
    rows: Mutex<Vec<Row>>,
    faults: Mutex<VecDeque<StoreError>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryTable {
    pub fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            title: title.into(),
            ..Self::default()
        })
    }

    /// Start from raw grid contents, header included.
    pub fn with_rows(title: impl Into<String>, rows: Vec<Row>) -> Arc<Self> {
        let table = Self::new(title);
        *table.lock_rows() = rows;
        table
    }

    /// The next call (read or write) fails with `err` instead of running.
    pub fn fail_next(&self, err: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(err);
    }

    pub fn fail_next_n(&self, n: usize, err: StoreError) {
        for _ in 0..n {
            self.fail_next(err.clone());
        }
    }

    /// Raw grid contents, as a spreadsheet UI would show them.
    pub fn snapshot(&self) -> Vec<Row> {
        self.lock_rows().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock_rows(&self) -> MutexGuard<'_, Vec<Row>> {
        self.rows.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_fault(&self) -> Result<()> {
        let next = self
            .faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match next {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn begin_read(&self) -> Result<()> {
        self.check_fault()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn begin_write(&self) -> Result<()> {
        self.check_fault()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn trim_trailing(row: &Row) -> Row {
    let end = row
        .iter()
        .rposition(|c| !c.is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    row[..end].to_vec()
}

fn is_blank(row: &Row) -> bool {
    row.iter().all(|c| c.is_empty())
}

impl Table for MemoryTable {
    fn title(&self) -> &str {
        &self.title
    }

    fn header(&self) -> Result<Row> {
        self.begin_read()?;
        Ok(self
            .lock_rows()
            .first()
            .map(trim_trailing)
            .unwrap_or_default())
    }

    fn rows(&self) -> Result<Vec<Row>> {
        self.begin_read()?;
        let rows = self.lock_rows();
        let last = rows.iter().rposition(|r| !is_blank(r)).map(|i| i + 1);
        Ok(match last {
            Some(n) => rows[..n].iter().map(trim_trailing).collect(),
            None => Vec::new(),
        })
    }

    fn write_rows(&self, start_row: usize, new_rows: &[Row]) -> Result<()> {
        if start_row == 0 {
            return Err(StoreError::InvalidRecord("row numbers start at 1".into()));
        }
        self.begin_write()?;
        let mut rows = self.lock_rows();
        let needed = start_row - 1 + new_rows.len();
        if rows.len() < needed {
            rows.resize(needed, Row::new());
        }
        for (offset, values) in new_rows.iter().enumerate() {
            rows[start_row - 1 + offset] = values.clone();
        }
        Ok(())
    }

    fn append_row(&self, values: &[String]) -> Result<()> {
        self.begin_write()?;
        let mut rows = self.lock_rows();
        while rows.last().map(is_blank).unwrap_or(false) {
            rows.pop();
        }
        rows.push(values.to_vec());
        Ok(())
    }

    fn delete_row(&self, row_number: usize) -> Result<()> {
        self.begin_write()?;
        let mut rows = self.lock_rows();
        if row_number == 0 || row_number > rows.len() {
            return Err(StoreError::Io(format!(
                "row {} is out of range (table has {} rows)",
                row_number,
                rows.len()
            )));
        }
        rows.remove(row_number - 1);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.begin_write()?;
        self.lock_rows().clear();
        Ok(())
    }
}

/// Hands out the same [`MemoryTable`] on every connect, counting calls.
#[derive(Debug)]
pub struct MemoryConnector {
    table: Arc<MemoryTable>,
    connects: AtomicUsize,
    faults: Mutex<VecDeque<StoreError>>,
}

impl MemoryConnector {
    pub fn new(table: Arc<MemoryTable>) -> Self {
        Self {
            table,
            connects: AtomicUsize::new(0),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    pub fn table(&self) -> &Arc<MemoryTable> {
        &self.table
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The next `connect` fails with `err`.
    pub fn fail_next(&self, err: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(err);
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> Result<Arc<dyn Table>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let fault = self
            .faults
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(err) = fault {
            return Err(err);
        }
        Ok(self.table.clone() as Arc<dyn Table>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn reads_trim_trailing_blanks_like_a_sheet() {
        let t = MemoryTable::with_rows(
            "t",
            vec![row(&["id", "name", "note"]), row(&["1", "", ""]), row(&["", "", ""])],
        );
        assert_eq!(t.rows().unwrap(), vec![row(&["id", "name", "note"]), row(&["1"])]);
    }

    #[test]
    fn delete_shifts_rows_up() {
        let t = MemoryTable::with_rows("t", vec![row(&["id"]), row(&["a"]), row(&["b"]), row(&["c"])]);
        t.delete_row(3).unwrap();
        assert_eq!(t.snapshot(), vec![row(&["id"]), row(&["a"]), row(&["c"])]);
        assert!(t.delete_row(9).is_err());
    }

    #[test]
    fn injected_faults_fire_once_in_order() {
        let t = MemoryTable::new("t");
        t.fail_next(StoreError::Quota("429".into()));
        assert!(t.rows().unwrap_err().is_quota());
        assert_eq!(t.rows().unwrap(), Vec::<Row>::new());
        assert_eq!(t.read_count(), 1);
    }

    #[test]
    fn write_rows_grows_the_grid() {
        let t = MemoryTable::new("t");
        t.write_row(3, &row(&["x"])).unwrap();
        assert_eq!(t.snapshot(), vec![Row::new(), Row::new(), row(&["x"])]);
        t.append_row(&row(&["y"])).unwrap();
        assert_eq!(t.snapshot().len(), 4);
    }
}
