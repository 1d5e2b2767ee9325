//! Storage backends: flat-file tubs, SQLite tubs, and the tub directory factory.

pub mod handler;
pub mod sqlite;
pub mod tub;

use crate::errors::Result;
use crate::value::{Kind, Record, Value};

/// Read access by record index. Stores and view transforms both provide it,
/// so views can wrap stores or other views.
pub trait RecordSource {
    /// Fully resolved record: artifacts loaded into memory.
    fn read(&self, ix: u64) -> Result<Record>;

    /// Record as persisted. Artifact channels hold paths. Backends without
    /// side files return the same thing as `read`.
    fn read_raw(&self, ix: u64) -> Result<Record> {
        self.read(ix)
    }

    /// Declared kind of a channel.
    fn kind_of(&self, channel: &str) -> Option<Kind>;
}

/// Write side of the contract both backends implement.
pub trait RecordStore: RecordSource {
    /// Persist one record. `Ok(None)` means the record was rejected and
    /// dropped without failing the caller.
    fn write_record(&mut self, values: &Record) -> Result<Option<u64>>;

    /// Persist values positionally, in schema order.
    fn write_values(&mut self, values: Vec<Value>) -> Result<Option<u64>>;

    /// Number of stored records.
    fn count(&self) -> Result<usize>;

    /// Channel names in schema order.
    fn inputs(&self) -> Vec<String>;

    /// Release resources, keeping data.
    fn shutdown(self) -> Result<()>
    where
        Self: Sized;

    /// Remove every persisted byte of the store.
    fn delete(self) -> Result<()>
    where
        Self: Sized;
}
