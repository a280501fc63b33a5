// src/cache.rs

use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tracing::debug;

use crate::error::Result;
use crate::record::Record;
use crate::schema::ReadyTable;

/// Result of one full table scan, with an id → position index.
///
/// Positions index into `records`, not into the sheet, and are only valid
/// for this snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    records: Vec<Record>,
    index: HashMap<String, usize>,
    loaded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(records: Vec<Record>) -> Self {
        let mut index = HashMap::with_capacity(records.len());
        for (i, r) in records.iter().enumerate() {
            if r.id().is_empty() {
                continue;
            }
            // first occurrence wins, same as a top-down scan
            index.entry(r.id().to_string()).or_insert(i);
        }
        Self {
            records,
            index,
            loaded_at: Utc::now(),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct Timed<T> {
    at: Instant,
    value: T,
}

/// Two caches with separate rules:
///
/// - the table handle (auth + worksheet lookup + schema check) is reused for
///   `handle_ttl` and survives mutations;
/// - the record snapshot lives until `snapshot_ttl` passes or a mutation
///   invalidates it; with no TTL only mutations drop it.
///
/// A generation counter guards against a scan that started before an
/// invalidation being stored after it.
pub struct SnapshotCache {
    handle_ttl: Duration,
    snapshot_ttl: Option<Duration>,
    handle: Mutex<Option<Timed<ReadyTable>>>,
    snapshot: Mutex<Option<Timed<Arc<Snapshot>>>>,
    generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SnapshotCache {
    pub fn new(handle_ttl: Duration, snapshot_ttl: Option<Duration>) -> Self {
        Self {
            handle_ttl,
            snapshot_ttl,
            handle: Mutex::new(None),
            snapshot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Cached handle if still fresh, otherwise run `acquire` and cache it.
    /// Concurrent callers wait for a single acquisition.
    pub fn handle_or_acquire<F>(&self, acquire: F) -> Result<ReadyTable>
    where
        F: FnOnce() -> Result<ReadyTable>,
    {
        let mut slot = lock(&self.handle);
        if let Some(cached) = slot.as_ref() {
            if cached.at.elapsed() < self.handle_ttl {
                return Ok(cached.value.clone());
            }
            debug!("table handle expired");
        }
        let ready = acquire()?;
        *slot = Some(Timed {
            at: Instant::now(),
            value: ready.clone(),
        });
        Ok(ready)
    }

    /// Forget the handle so the next call re-authenticates.
    pub fn drop_handle(&self) {
        lock(&self.handle).take();
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The current snapshot, unless invalidated or older than `snapshot_ttl`.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        let slot = lock(&self.snapshot);
        let cached = slot.as_ref()?;
        match self.snapshot_ttl {
            Some(ttl) if cached.at.elapsed() >= ttl => None,
            _ => Some(cached.value.clone()),
        }
    }

    /// Store `snap` if nothing was invalidated since `generation` was read.
    pub fn store_snapshot(&self, generation: u64, snap: Arc<Snapshot>) -> bool {
        let mut slot = lock(&self.snapshot);
        if self.generation() != generation {
            return false;
        }
        *slot = Some(Timed {
            at: Instant::now(),
            value: snap,
        });
        true
    }

    pub fn invalidate_snapshot(&self) {
        let mut slot = lock(&self.snapshot);
        self.generation.fetch_add(1, Ordering::SeqCst);
        slot.take();
    }
}
