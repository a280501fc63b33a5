// src/schema/evolution.rs

use std::collections::HashMap;

use super::Schema;
use crate::table::Row;

/// Re-shape rows written under `old_header` so they line up with `target`.
///
/// Columns are matched by name. Target columns the old header lacks come out
/// empty; old columns the target lacks are dropped. Returns the new rows and
/// the names of the dropped columns.
pub fn evolve_rows(old_header: &[String], rows: &[Row], target: &Schema) -> (Vec<Row>, Vec<String>) {
    let mut old_pos: HashMap<&str, usize> = HashMap::with_capacity(old_header.len());
    for (i, name) in old_header.iter().enumerate() {
        old_pos.entry(name.as_str()).or_insert(i);
    }

    let mapping: Vec<Option<usize>> = target
        .columns()
        .iter()
        .map(|c| old_pos.get(c.as_str()).copied())
        .collect();

    let dropped = old_header
        .iter()
        .filter(|c| !c.is_empty() && !target.contains(c))
        .cloned()
        .collect();

    let evolved = rows
        .iter()
        .map(|row| {
            mapping
                .iter()
                .map(|src| {
                    src.and_then(|i| row.get(i))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();

    (evolved, dropped)
}
