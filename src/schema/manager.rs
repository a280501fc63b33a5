// src/schema/manager.rs

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{evolve_rows, Schema};
use crate::config::MismatchPolicy;
use crate::error::{Result, StoreError};
use crate::retry::RetryPolicy;
use crate::table::{Row, Table};

/// What `ensure_schema` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Header already matched; nothing written.
    Matched,
    /// Table had no header; one was written.
    Initialized,
    /// Header differed; the table was cleared and its data rows lost.
    Repaired { dropped_rows: usize },
    /// Header differed; data rows were rewritten in place under the new
    /// header.
    Migrated {
        rows: usize,
        dropped_columns: Vec<String>,
    },
}

/// A table handle whose header row is known to equal the schema.
#[derive(Clone)]
pub struct ReadyTable {
    table: Arc<dyn Table>,
    status: SchemaStatus,
}

impl ReadyTable {
    pub fn table(&self) -> &Arc<dyn Table> {
        &self.table
    }

    pub fn status(&self) -> &SchemaStatus {
        &self.status
    }
}

impl std::fmt::Debug for ReadyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyTable")
            .field("table", &self.table.title())
            .field("status", &self.status)
            .finish()
    }
}

/// Keeps a table's header row equal to the expected schema.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    schema: Arc<Schema>,
    policy: MismatchPolicy,
    retry: RetryPolicy,
}

impl SchemaManager {
    pub fn new(schema: Arc<Schema>, policy: MismatchPolicy, retry: RetryPolicy) -> Self {
        Self {
            schema,
            policy,
            retry,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn header_row(&self) -> Row {
        self.schema.columns().to_vec()
    }

    /// Check row 1 against the schema and fix it according to the policy.
    ///
    /// With [`MismatchPolicy::Wipe`] a differing header destroys every data
    /// row in the table.
    pub fn ensure_schema(&self, table: Arc<dyn Table>) -> Result<ReadyTable> {
        let header = self.retry.execute(|| table.header())?;

        let status = if header.is_empty() {
            info!(table = table.title(), "writing header to empty table");
            self.write_header(table.as_ref())?;
            SchemaStatus::Initialized
        } else if self.schema.matches(&header) {
            debug!(table = table.title(), "header matches schema");
            SchemaStatus::Matched
        } else {
            self.repair(table.as_ref(), header)?
        };

        Ok(ReadyTable { table, status })
    }

    /// Clear the table and write only the header.
    pub fn reset(&self, table: &dyn Table) -> Result<()> {
        self.retry.execute(|| table.clear())?;
        self.write_header(table)?;
        info!(table = table.title(), "table reset");
        Ok(())
    }

    fn write_header(&self, table: &dyn Table) -> Result<()> {
        let header = self.header_row();
        self.retry.execute(|| table.write_row(1, &header))
    }

    fn repair(&self, table: &dyn Table, found: Row) -> Result<SchemaStatus> {
        match self.policy {
            MismatchPolicy::Reject => Err(StoreError::SchemaMismatch {
                expected: self.header_row(),
                found,
            }),
            MismatchPolicy::Wipe => {
                let rows = self.retry.execute(|| table.rows())?;
                let dropped_rows = rows.len().saturating_sub(1);
                warn!(
                    table = table.title(),
                    found = ?found,
                    dropped_rows,
                    "header differs from schema; clearing table"
                );
                self.reset(table)?;
                Ok(SchemaStatus::Repaired { dropped_rows })
            }
            MismatchPolicy::Migrate => {
                let rows = self.retry.execute(|| table.rows())?;
                let data = rows.get(1..).unwrap_or_default();
                let (evolved, dropped_columns) = evolve_rows(&found, data, &self.schema);
                warn!(
                    table = table.title(),
                    found = ?found,
                    rows = evolved.len(),
                    dropped_columns = ?dropped_columns,
                    "header differs from schema; migrating rows"
                );

                // One write over the old extent: the row count is unchanged,
                // and padding to the old width blanks any dropped columns. A
                // failed write leaves the old rows in place.
                let width = rows
                    .iter()
                    .map(Vec::len)
                    .chain([found.len(), self.schema.len()])
                    .max()
                    .unwrap_or(0);
                let mut grid = Vec::with_capacity(evolved.len() + 1);
                grid.push(self.header_row());
                grid.extend(evolved);
                for r in &mut grid {
                    r.resize(width, String::new());
                }
                self.retry.execute(|| table.write_rows(1, &grid))?;

                Ok(SchemaStatus::Migrated {
                    rows: grid.len() - 1,
                    dropped_columns,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTable;
    use std::time::Duration;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn manager(policy: MismatchPolicy) -> SchemaManager {
        let retry = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        SchemaManager::new(
            Arc::new(Schema::new(["id", "event_name", "reasons"])),
            policy,
            retry,
        )
    }

    #[test]
    fn empty_table_gets_header() {
        let t = MemoryTable::new("t");
        let ready = manager(MismatchPolicy::Wipe).ensure_schema(t.clone()).unwrap();
        assert_eq!(ready.status(), &SchemaStatus::Initialized);
        assert_eq!(t.snapshot(), vec![row(&["id", "event_name", "reasons"])]);
    }

    #[test]
    fn matching_header_is_idempotent() {
        let t = MemoryTable::with_rows(
            "t",
            vec![row(&["id", "event_name", "reasons"]), row(&["a", "Conf", "A|B"])],
        );
        let m = manager(MismatchPolicy::Wipe);
        m.ensure_schema(t.clone()).unwrap();
        let ready = m.ensure_schema(t.clone()).unwrap();

        assert_eq!(ready.status(), &SchemaStatus::Matched);
        assert_eq!(t.write_count(), 0);
        assert_eq!(t.snapshot().len(), 2);
    }

    #[test]
    fn mismatch_wipes_data_by_default() {
        let t = MemoryTable::with_rows(
            "t",
            vec![row(&["id", "name"]), row(&["a", "x"]), row(&["b", "y"])],
        );
        let ready = manager(MismatchPolicy::Wipe).ensure_schema(t.clone()).unwrap();

        assert_eq!(ready.status(), &SchemaStatus::Repaired { dropped_rows: 2 });
        assert_eq!(t.snapshot(), vec![row(&["id", "event_name", "reasons"])]);
    }

    #[test]
    fn mismatch_can_migrate_rows() {
        let t = MemoryTable::with_rows(
            "t",
            vec![row(&["event_name", "id"]), row(&["Conf", "a"])],
        );
        let ready = manager(MismatchPolicy::Migrate).ensure_schema(t.clone()).unwrap();

        assert_eq!(
            ready.status(),
            &SchemaStatus::Migrated {
                rows: 1,
                dropped_columns: vec![]
            }
        );
        assert_eq!(
            t.rows().unwrap(),
            vec![row(&["id", "event_name", "reasons"]), row(&["a", "Conf"])]
        );
    }

    #[test]
    fn migration_blanks_dropped_columns() {
        let t = MemoryTable::with_rows(
            "t",
            vec![
                row(&["event_name", "id", "legacy", "notes"]),
                row(&["Conf", "a", "x", "y"]),
                row(&["Summit", "b"]),
            ],
        );
        let ready = manager(MismatchPolicy::Migrate).ensure_schema(t.clone()).unwrap();

        assert_eq!(
            ready.status(),
            &SchemaStatus::Migrated {
                rows: 2,
                dropped_columns: vec!["legacy".to_string(), "notes".to_string()]
            }
        );
        assert_eq!(
            t.rows().unwrap(),
            vec![
                row(&["id", "event_name", "reasons"]),
                row(&["a", "Conf"]),
                row(&["b", "Summit"]),
            ]
        );
    }

    /// Reads pass through; every write fails with a backend error.
    struct ReadOnly(Arc<MemoryTable>);

    impl Table for ReadOnly {
        fn title(&self) -> &str {
            self.0.title()
        }
        fn header(&self) -> Result<Row> {
            self.0.header()
        }
        fn rows(&self) -> Result<Vec<Row>> {
            self.0.rows()
        }
        fn write_rows(&self, _start_row: usize, _rows: &[Row]) -> Result<()> {
            Err(StoreError::Io("500 backend error".into()))
        }
        fn append_row(&self, _row: &[String]) -> Result<()> {
            Err(StoreError::Io("500 backend error".into()))
        }
        fn delete_row(&self, _row_number: usize) -> Result<()> {
            Err(StoreError::Io("500 backend error".into()))
        }
        fn clear(&self) -> Result<()> {
            self.0.clear()
        }
    }

    #[test]
    fn failed_migration_keeps_existing_rows() {
        let inner = MemoryTable::with_rows(
            "t",
            vec![row(&["event_name", "id"]), row(&["Conf", "a"])],
        );
        let err = manager(MismatchPolicy::Migrate)
            .ensure_schema(Arc::new(ReadOnly(inner.clone())))
            .unwrap_err();

        assert_eq!(err, StoreError::Io("500 backend error".into()));
        assert_eq!(
            inner.snapshot(),
            vec![row(&["event_name", "id"]), row(&["Conf", "a"])]
        );
    }

    #[test]
    fn mismatch_can_be_rejected() {
        let t = MemoryTable::with_rows("t", vec![row(&["id"]), row(&["a"])]);
        let err = manager(MismatchPolicy::Reject)
            .ensure_schema(t.clone())
            .unwrap_err();

        assert!(matches!(err, StoreError::SchemaMismatch { .. }));
        assert_eq!(t.snapshot().len(), 2);
    }

    #[test]
    fn quota_on_header_read_is_retried_but_auth_is_not() {
        let t = MemoryTable::new("t");
        t.fail_next(StoreError::Quota("429".into()));
        manager(MismatchPolicy::Wipe).ensure_schema(t.clone()).unwrap();
        assert_eq!(t.snapshot().len(), 1);

        let t = MemoryTable::new("t");
        t.fail_next(StoreError::Auth("expired".into()));
        t.fail_next(StoreError::Quota("never reached".into()));
        let err = manager(MismatchPolicy::Wipe)
            .ensure_schema(t.clone())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
