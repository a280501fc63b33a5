// src/record.rs

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::{collections::BTreeMap, sync::Arc};

use crate::schema::Schema;
use crate::table::Row;

/// Field name → value, used for new records and field-level updates.
/// Names outside the schema are ignored by the store.
pub type Fields = BTreeMap<String, String>;

/// One table row mapped onto the schema. Always holds exactly one value per
/// schema column; cells missing from the sheet read back as "".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    schema: Arc<Schema>,
    values: Vec<String>,
}

impl Record {
    /// Positional mapping; short rows are padded, extra cells dropped.
    pub fn from_row(schema: Arc<Schema>, mut row: Row) -> Self {
        row.resize(schema.len(), String::new());
        Self {
            schema,
            values: row,
        }
    }

    /// Build from named fields; absent columns become "".
    pub fn from_fields(schema: Arc<Schema>, fields: &Fields) -> Self {
        let values = schema
            .columns()
            .iter()
            .map(|c| fields.get(c).cloned().unwrap_or_default())
            .collect();
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn id(&self) -> &str {
        self.get("id").unwrap_or("")
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.schema
            .position(column)
            .map(|i| self.values[i].as_str())
    }

    /// Set one field. Returns false when the column is not in the schema.
    pub fn set(&mut self, column: &str, value: impl Into<String>) -> bool {
        match self.schema.position(column) {
            Some(i) => {
                self.values[i] = value.into();
                true
            }
            None => false,
        }
    }

    /// Apply `changes` over the current values; unlisted fields keep theirs.
    pub fn merge(&mut self, changes: &Fields) {
        for (k, v) in changes {
            self.set(k, v.clone());
        }
    }

    /// Values in schema column order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn to_row(&self) -> Row {
        self.values.clone()
    }

    pub fn to_fields(&self) -> Fields {
        self.schema
            .columns()
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (col, val) in self.schema.columns().iter().zip(&self.values) {
            map.serialize_entry(col, val)?;
        }
        map.end()
    }
}

/// Convenience for building [`Fields`] from string pairs.
pub fn fields<'a, I>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
