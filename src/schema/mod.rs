pub mod evolution;
pub mod manager;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use evolution::evolve_rows;
pub use manager::{ReadyTable, SchemaManager, SchemaStatus};

/// Ordered column names. Position is part of identity: two schemas with the
/// same names in a different order are different schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Schema {
    columns: Vec<String>,
    positions: HashMap<String, usize>,
}

impl Schema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut positions = HashMap::with_capacity(columns.len());
        for (i, c) in columns.iter().enumerate() {
            positions.entry(c.clone()).or_insert(i);
        }
        Self { columns, positions }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.positions.contains_key(column)
    }

    /// True when `header` is exactly this schema, cell for cell.
    pub fn matches(&self, header: &[String]) -> bool {
        self.columns.as_slice() == header
    }
}

impl From<Vec<String>> for Schema {
    fn from(columns: Vec<String>) -> Self {
        Schema::new(columns)
    }
}

impl From<Schema> for Vec<String> {
    fn from(schema: Schema) -> Self {
        schema.columns
    }
}
