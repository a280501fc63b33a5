//! Record store over a Google Sheets worksheet: schema-checked header, id
//! addressed CRUD, quota-aware retries, and cached handles and snapshots.

pub mod cache;
pub mod config;
pub mod error;
pub mod record;
pub mod retry;
pub mod schema;
pub mod store;
pub mod table;

pub use cache::{Snapshot, SnapshotCache};
pub use config::{MismatchPolicy, StoreConfig};
pub use error::{Result, StoreError};
pub use record::{fields, Fields, Record};
pub use retry::RetryPolicy;
pub use schema::{Schema, SchemaManager, SchemaStatus};
pub use store::RecordStore;
