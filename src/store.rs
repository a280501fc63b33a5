// src/store.rs

use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

use crate::cache::{Snapshot, SnapshotCache};
use crate::config::{MismatchPolicy, StoreConfig};
use crate::error::{Result, StoreError};
use crate::record::{Fields, Record};
use crate::retry::RetryPolicy;
use crate::schema::{ReadyTable, Schema, SchemaManager, SchemaStatus};
use crate::table::{Connector, Row, SheetsConnector, Table};

/// How many trailing records feed [`RecordStore::fingerprint`].
const FINGERPRINT_TAIL: usize = 10;

/// CRUD-by-id over a schema-less remote table.
///
/// Reads go through a memoized snapshot that expires after the configured
/// snapshot TTL; every successful mutation also drops it.
/// Mutations always locate their row with a fresh top-down scan, since any
/// delete (ours or another process's) shifts the rows below it. Within one
/// process mutations are serialized; across processes there is no isolation
/// and the last writer wins.
pub struct RecordStore {
    connector: Arc<dyn Connector>,
    schema: Arc<Schema>,
    manager: SchemaManager,
    retry: RetryPolicy,
    cache: SnapshotCache,
    writer: Mutex<()>,
}

impl RecordStore {
    pub fn new(
        connector: Arc<dyn Connector>,
        schema: Schema,
        on_mismatch: MismatchPolicy,
        retry: RetryPolicy,
        cache: SnapshotCache,
    ) -> Self {
        let schema = Arc::new(schema);
        let manager = SchemaManager::new(schema.clone(), on_mismatch, retry.clone());
        Self {
            connector,
            schema,
            manager,
            retry,
            cache,
            writer: Mutex::new(()),
        }
    }

    /// Build a store over any connector using the config's schema, retry and
    /// cache settings.
    pub fn with_connector(cfg: &StoreConfig, connector: Arc<dyn Connector>) -> Self {
        Self::new(
            connector,
            Schema::new(cfg.schema.iter().cloned()),
            cfg.on_schema_mismatch,
            RetryPolicy::from(&cfg.retry),
            SnapshotCache::new(cfg.cache.handle_ttl(), cfg.cache.snapshot_ttl()),
        )
    }

    /// Store backed by the Google Sheets worksheet named in `cfg`.
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        let connector = SheetsConnector::new(cfg)?;
        Ok(Self::with_connector(cfg, Arc::new(connector)))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    // ─── handles ─────────────────────────────────────────────────────────

    fn ready(&self) -> Result<ReadyTable> {
        let result = self.cache.handle_or_acquire(|| {
            let table = self.retry.execute(|| self.connector.connect())?;
            self.manager.ensure_schema(table)
        });
        self.track(result)
    }

    /// A fatal error means the cached handle is no good anymore.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.cache.drop_handle();
            }
        }
        result
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Acquire the handle (checking the header on first use) and report what
    /// the schema check did.
    pub fn ensure_schema(&self) -> Result<SchemaStatus> {
        Ok(self.ready()?.status().clone())
    }

    // ─── reads ───────────────────────────────────────────────────────────

    fn scan(&self, table: &dyn Table) -> Result<Vec<Row>> {
        let rows = self.retry.execute(|| table.rows());
        self.track(rows)
    }

    /// Current snapshot, scanning the table when the cache is cold.
    pub fn snapshot(&self) -> Result<Arc<Snapshot>> {
        if let Some(snap) = self.cache.snapshot() {
            return Ok(snap);
        }

        let generation = self.cache.generation();
        let ready = self.ready()?;
        let rows = self.scan(ready.table().as_ref())?;
        // blank rows between records come back as all-empty records
        let records: Vec<Record> = rows
            .into_iter()
            .skip(1)
            .map(|row| Record::from_row(self.schema.clone(), row))
            .collect();
        debug!(records = records.len(), "loaded table");

        let snap = Arc::new(Snapshot::new(records));
        self.cache.store_snapshot(generation, snap.clone());
        Ok(snap)
    }

    /// Every record, in sheet order. Empty when only the header exists.
    pub fn load_all(&self) -> Result<Vec<Record>> {
        Ok(self.snapshot()?.records().to_vec())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Record>> {
        Ok(self.snapshot()?.get(id).cloned())
    }

    /// Physical row number (1-based, header is row 1) and contents of the
    /// first row whose id matches. Never cached. Rows without an id are not
    /// addressable.
    fn locate(&self, table: &dyn Table, id: &str) -> Result<Option<(usize, Record)>> {
        if id.is_empty() {
            return Ok(None);
        }
        let id_col = self
            .schema
            .position("id")
            .ok_or_else(|| StoreError::InvalidRecord("schema has no `id` column".into()))?;
        let rows = self.scan(table)?;
        Ok(rows
            .into_iter()
            .enumerate()
            .skip(1)
            .find(|(_, row)| row.get(id_col).map(String::as_str) == Some(id))
            .map(|(i, row)| (i + 1, Record::from_row(self.schema.clone(), row))))
    }

    // ─── writes ──────────────────────────────────────────────────────────

    /// Write `fields` as a new last row, in schema order. Columns not in the
    /// schema are ignored; missing ones are written as "". The id is the
    /// caller's to generate and must be non-empty.
    #[instrument(skip_all)]
    pub fn append(&self, fields: &Fields) -> Result<()> {
        let record = Record::from_fields(self.schema.clone(), fields);
        if record.id().is_empty() {
            return Err(StoreError::InvalidRecord("record has no id".into()));
        }

        let _w = self.lock_writer();
        let ready = self.ready()?;
        let table = ready.table();
        let row = record.to_row();
        let appended = self.retry.execute(|| table.append_row(&row));
        self.track(appended)?;
        self.cache.invalidate_snapshot();
        info!(id = record.id(), "appended record");
        Ok(())
    }

    pub fn append_record(&self, record: &Record) -> Result<()> {
        self.append(&record.to_fields())
    }

    /// Merge `changes` into the record with `id` and rewrite its whole row.
    /// `Ok(false)` when no row has that id. The id itself cannot change.
    #[instrument(skip(self, changes))]
    pub fn update_by_id(&self, id: &str, changes: &Fields) -> Result<bool> {
        if let Some(new_id) = changes.get("id") {
            if new_id != id {
                return Err(StoreError::InvalidRecord(format!(
                    "cannot change id {:?} to {:?}",
                    id, new_id
                )));
            }
        }

        let _w = self.lock_writer();
        let ready = self.ready()?;
        let table = ready.table();
        let Some((row_number, mut record)) = self.locate(table.as_ref(), id)? else {
            debug!("no row with this id; nothing updated");
            return Ok(false);
        };

        record.merge(changes);
        let written = self
            .retry
            .execute(|| table.write_row(row_number, record.values()));
        self.track(written)?;
        self.cache.invalidate_snapshot();
        info!(row = row_number, "updated record");
        Ok(true)
    }

    /// Remove the row with `id`; rows below it move up. `Ok(false)` when no
    /// row has that id.
    #[instrument(skip(self))]
    pub fn delete_by_id(&self, id: &str) -> Result<bool> {
        let _w = self.lock_writer();
        let ready = self.ready()?;
        let table = ready.table();
        let Some((row_number, _)) = self.locate(table.as_ref(), id)? else {
            debug!("no row with this id; nothing deleted");
            return Ok(false);
        };

        let deleted = self.retry.execute(|| table.delete_row(row_number));
        self.track(deleted)?;
        self.cache.invalidate_snapshot();
        info!(row = row_number, "deleted record");
        Ok(true)
    }

    /// Drop every record, leaving only the header.
    pub fn reset(&self) -> Result<()> {
        let _w = self.lock_writer();
        let ready = self.ready()?;
        let reset = self.manager.reset(ready.table().as_ref());
        self.track(reset)?;
        self.cache.invalidate_snapshot();
        Ok(())
    }

    /// Digest of the most recent records, for cheap change detection by
    /// dashboards. `"empty"` when there are none.
    pub fn fingerprint(&self) -> Result<String> {
        let snap = self.snapshot()?;
        let records = snap.records();
        if records.is_empty() {
            return Ok("empty".to_string());
        }
        let tail = &records[records.len().saturating_sub(FINGERPRINT_TAIL)..];
        let bytes = serde_json::to_vec(tail)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}
