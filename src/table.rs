//! Materialized table: an in-memory snapshot of a store's records.
//!
//! Rows hold records as they sit in the store: artifact channels carry
//! absolute file paths, not pixels. [`Table::resolve`] turns a row into its
//! final in-memory form when a batch is assembled. A table is never updated
//! in place; stores drop their cached table on mutation and build a new one.

use std::collections::{BTreeMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::errors::{Result, TubError};
use crate::frame::ImageArray;
use crate::value::{Kind, Record, Value};

#[derive(Debug, Clone, Default)]
pub struct Table {
    columns: Vec<String>,
    kinds: BTreeMap<String, Kind>,
    rows: Vec<Record>,
}

impl Table {
    /// Columns are the union of row keys, in first-seen order.
    pub fn new(kinds: BTreeMap<String, Kind>, rows: Vec<Record>) -> Self {
        Self::with_columns(Vec::new(), kinds, rows)
    }

    /// Like [`Table::new`], but `declared` columns come first and exist
    /// even when no row holds them.
    pub fn with_columns(
        declared: Vec<String>,
        kinds: BTreeMap<String, Kind>,
        rows: Vec<Record>,
    ) -> Self {
        let mut seen: HashSet<String> = declared.iter().cloned().collect();
        let mut columns = declared;
        for row in &rows {
            for key in row.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
        Self {
            columns,
            kinds,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn kinds(&self) -> &BTreeMap<String, Kind> {
        &self.kinds
    }

    pub fn kind_of(&self, column: &str) -> Option<&Kind> {
        self.kinds.get(column)
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&Record> {
        self.rows.get(index)
    }

    /// A new table holding the given rows, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Table {
        let rows = indices
            .iter()
            .filter_map(|&i| self.rows.get(i).cloned())
            .collect();
        Table {
            columns: self.columns.clone(),
            kinds: self.kinds.clone(),
            rows,
        }
    }

    /// Randomly partition rows once: `round(fraction * len)` rows go to the
    /// first table, the rest to the second.
    pub fn split<R: Rng + ?Sized>(&self, fraction: f64, rng: &mut R) -> Result<(Table, Table)> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(TubError::InvalidConfiguration(format!(
                "train fraction must be in (0, 1), got {fraction}"
            )));
        }
        let mut indices: Vec<usize> = (0..self.rows.len()).collect();
        indices.shuffle(rng);
        let n_first = (fraction * self.rows.len() as f64).round() as usize;
        let (first, second) = indices.split_at(n_first.min(indices.len()));
        Ok((self.select_rows(first), self.select_rows(second)))
    }

    /// Concatenate tables row-wise, keeping only the columns every table
    /// has. Kinds merge with later tables winning. Returns the combined
    /// table and the columns that were dropped.
    pub fn concat_inner(tables: Vec<Table>) -> (Table, Vec<String>) {
        let mut iter = tables.iter();
        let Some(first) = iter.next() else {
            return (Table::default(), Vec::new());
        };
        let mut shared: Vec<String> = first.columns.clone();
        for table in iter {
            let cols: HashSet<&String> = table.columns.iter().collect();
            shared.retain(|c| cols.contains(c));
        }
        let keep: HashSet<&String> = shared.iter().collect();

        let mut dropped: Vec<String> = Vec::new();
        for table in &tables {
            for col in &table.columns {
                if !keep.contains(col) && !dropped.contains(col) {
                    dropped.push(col.clone());
                }
            }
        }

        let mut kinds = BTreeMap::new();
        let mut rows = Vec::new();
        for table in tables {
            kinds.extend(table.kinds);
            rows.extend(table.rows.into_iter().map(|mut row| {
                row.retain(|k, _| keep.contains(k));
                row
            }));
        }
        (
            Table {
                columns: shared,
                kinds,
                rows,
            },
            dropped,
        )
    }

    /// Load artifacts: `image_array` channels holding a path become pixels.
    /// Everything else passes through.
    pub fn resolve(&self, record: Record) -> Result<Record> {
        record
            .into_iter()
            .map(|(key, value)| {
                let value = match (self.kinds.get(&key), value) {
                    (Some(Kind::ImageArray), Value::Str(path)) => {
                        Value::Image(ImageArray::open(&path)?)
                    }
                    (_, other) => other,
                };
                Ok((key, value))
            })
            .collect()
    }
}
