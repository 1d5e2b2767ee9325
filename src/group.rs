//! Several file tubs read as one table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::Result;
use crate::storage::tub::Tub;
use crate::table::Table;
use crate::value::Kind;

/// Read-only union of tubs. Rows are concatenated in the order the paths
/// were given; only columns every tub has survive.
pub struct TubGroup {
    paths: Vec<PathBuf>,
    /// Channel kinds across all tubs, in first-seen order. Later tubs win
    /// when the same channel is declared twice.
    channels: Vec<(String, Kind)>,
    table: Arc<Table>,
}

impl TubGroup {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut channels: Vec<(String, Kind)> = Vec::new();
        let mut tables = Vec::with_capacity(paths.len());
        let mut opened = Vec::with_capacity(paths.len());

        for path in paths {
            let mut tub = Tub::open(path)?;
            for ch in tub.schema().channels() {
                match channels.iter_mut().find(|(name, _)| *name == ch.name) {
                    Some((_, kind)) => *kind = ch.kind.clone(),
                    None => channels.push((ch.name.clone(), ch.kind.clone())),
                }
            }
            let table = tub.table()?;
            tables.push(Arc::unwrap_or_clone(table));
            opened.push(tub.path().to_path_buf());
        }

        let total: usize = tables.iter().map(Table::len).sum();
        info!(tubs = opened.len(), records = total, "joining tubs");

        let (table, dropped) = Table::concat_inner(tables);
        if !dropped.is_empty() {
            warn!(?dropped, "columns missing from some tubs were dropped");
        }

        Ok(Self {
            paths: opened,
            channels,
            table: Arc::new(table),
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn inputs(&self) -> Vec<String> {
        self.channels.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn types(&self) -> Vec<Kind> {
        self.channels.iter().map(|(_, k)| k.clone()).collect()
    }

    pub fn table(&self) -> Arc<Table> {
        Arc::clone(&self.table)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
