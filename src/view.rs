//! Derived-record views over any [`RecordSource`].
//!
//! Views wrap a source and are sources themselves, so they layer:
//! `TimeStacker::new(ImageStacker::new(tub), offsets)` stacks frames in
//! space and then in time.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{Result, TubError};
use crate::frame::ImageArray;
use crate::storage::RecordSource;
use crate::table::Table;
use crate::value::{Kind, Record, Value};

fn frame_of(key: &str, value: Option<&Value>) -> Result<ImageArray> {
    match value {
        Some(Value::Image(img)) => Ok(img.clone()),
        Some(Value::Str(path)) => ImageArray::open(path),
        _ => Err(TubError::MissingColumn(key.to_string())),
    }
}

/// Packs each image channel of records `ix-2`, `ix-1`, `ix` into one
/// three-channel frame of luminance values, oldest in channel 0.
pub struct ImageStacker<S> {
    source: S,
}

impl<S: RecordSource> ImageStacker<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn inner(&self) -> &S {
        &self.source
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    fn image_keys(&self, record: &Record) -> Vec<String> {
        record
            .keys()
            .filter(|k| self.source.kind_of(k).is_some_and(|kind| kind.is_image()))
            .cloned()
            .collect()
    }
}

impl<S: RecordSource> RecordSource for ImageStacker<S> {
    /// Records at `ix <= 1` have no history and come back exactly as the
    /// wrapped source reads them.
    fn read(&self, ix: u64) -> Result<Record> {
        let mut data = self.source.read(ix)?;
        if ix <= 1 {
            return Ok(data);
        }
        let keys = self.image_keys(&data);

        let older = self.source.read(ix - 2)?;
        let old = self.source.read(ix - 1)?;
        for key in keys {
            let a = frame_of(&key, older.get(&key))?;
            let b = frame_of(&key, old.get(&key))?;
            let c = frame_of(&key, data.get(&key))?;
            data.insert(key, Value::Image(ImageArray::stack3(&a, &b, &c)?));
        }
        Ok(data)
    }

    fn read_raw(&self, ix: u64) -> Result<Record> {
        self.source.read_raw(ix)
    }

    fn kind_of(&self, channel: &str) -> Option<Kind> {
        self.source.kind_of(channel)
    }
}

/// A time-stacked record plus the offsets whose records were missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Stacked {
    pub record: Record,
    pub gaps: Vec<i64>,
}

/// Merges the records at `ix + offset` for each offset into one record.
///
/// Image channels of the first offset keep their name and are resolved
/// through the wrapped source. Every other channel is renamed
/// `<channel>_<offset>` and keeps its raw value.
pub struct TimeStacker<S> {
    source: S,
    offsets: Vec<i64>,
}

impl<S: RecordSource> TimeStacker<S> {
    pub fn new(source: S, offsets: Vec<i64>) -> Result<Self> {
        if offsets.is_empty() {
            return Err(TubError::InvalidConfiguration(
                "time stacker needs at least one offset".into(),
            ));
        }
        Ok(Self { source, offsets })
    }

    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    pub fn inner(&self) -> &S {
        &self.source
    }

    /// Missing records (`NotFound`, or an offset before index 0) are listed
    /// in `gaps`; any other failure is returned.
    pub fn read(&self, ix: u64) -> Result<Stacked> {
        let mut record = Record::new();
        let mut gaps = Vec::new();

        for (i, &offset) in self.offsets.iter().enumerate() {
            let Some(target) = (ix as i64).checked_add(offset).filter(|t| *t >= 0) else {
                gaps.push(offset);
                continue;
            };
            let target = target as u64;
            let raw = match self.source.read_raw(target) {
                Ok(raw) => raw,
                Err(e) if e.is_not_found() => {
                    debug!(ix, offset, "no record at offset");
                    gaps.push(offset);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut resolved: Option<Record> = None;
            for (key, value) in raw {
                let is_image = self.source.kind_of(&key).is_some_and(|k| k.is_image());
                if is_image && i == 0 {
                    if resolved.is_none() {
                        resolved = Some(self.source.read(target)?);
                    }
                    let value = resolved
                        .as_ref()
                        .and_then(|r| r.get(&key))
                        .cloned()
                        .ok_or_else(|| TubError::MissingColumn(key.clone()))?;
                    record.insert(key, value);
                } else {
                    record.insert(format!("{key}_{offset}"), value);
                }
            }
        }
        Ok(Stacked { record, gaps })
    }
}

impl<S: RecordSource> RecordSource for TimeStacker<S> {
    fn read(&self, ix: u64) -> Result<Record> {
        TimeStacker::read(self, ix).map(|s| s.record)
    }

    /// Renamed channels report the kind of the channel they came from.
    fn kind_of(&self, channel: &str) -> Option<Kind> {
        if let Some(kind) = self.source.kind_of(channel) {
            return Some(kind);
        }
        self.offsets.iter().find_map(|offset| {
            channel
                .strip_suffix(&format!("_{offset}"))
                .and_then(|base| self.source.kind_of(base))
        })
    }
}

/// Read derived records for `ids` into a table. Ids whose records (or
/// their neighbors) are missing are skipped.
pub fn materialize<S, I>(source: &S, ids: I) -> Result<Table>
where
    S: RecordSource,
    I: IntoIterator<Item = u64>,
{
    let mut rows = Vec::new();
    for ix in ids {
        match source.read(ix) {
            Ok(record) => rows.push(record),
            Err(e) if e.is_not_found() => debug!(ix, error = %e, "skipping record"),
            Err(e) => return Err(e),
        }
    }
    let mut kinds = BTreeMap::new();
    for row in &rows {
        for key in row.keys() {
            if kinds.contains_key(key) {
                continue;
            }
            if let Some(kind) = source.kind_of(key) {
                kinds.insert(key.clone(), kind);
            }
        }
    }
    Ok(Table::new(kinds, rows))
}
