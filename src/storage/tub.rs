//! Flat-file tub: one JSON document per record, images as side files.
//!
//! Layout:
//! ```text
//! {path}/meta.json                  {"inputs": [...], "types": [...]}
//! {path}/record_{id:06}.json        one record, scalar channels inline
//! {path}/{id:06}_{channel}_.jpg     image_array artifacts
//! {path}/{id:06}_{channel}_.png     image artifacts
//! ```
//!
//! The index is not stored anywhere: it is recovered by scanning the
//! directory for record files.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::errors::{Result, TubError};
use crate::frame::ImageArray;
use crate::schema::{Schema, TubMeta};
use crate::storage::{RecordSource, RecordStore};
use crate::table::Table;
use crate::value::{Kind, Record, Value};

pub const META_FILE: &str = "meta.json";
const RECORD_PREFIX: &str = "record";
const RECORD_SUFFIX: &str = ".json";

/// Result of scanning the tub directory for record files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexScan {
    /// Parsed record ids, ascending.
    pub ids: Vec<u64>,
    /// Record-like file names whose id could not be parsed.
    pub malformed: Vec<String>,
}

/// Outcome of [`Tub::check`].
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub total: usize,
    /// (record id, error message) for every record that failed to load.
    pub problems: Vec<(u64, String)>,
    /// Records deleted because `fix` was set.
    pub removed: Vec<u64>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Flat-file record store.
pub struct Tub {
    path: PathBuf,
    meta: TubMeta,
    schema: Schema,
    /// Last id handed out; `write` increments before use.
    current_ix: u64,
    /// Cached snapshot, dropped on every mutation.
    table: Option<Arc<Table>>,
}

/// `record_000042.json`
pub fn record_file_name(ix: u64) -> String {
    format!("{RECORD_PREFIX}_{ix:06}{RECORD_SUFFIX}")
}

/// `000042_cam-image_array_.jpg`
pub fn artifact_file_name(ix: u64, channel: &str, ext: &str) -> String {
    format!("{ix:06}_{channel}_.{ext}").replace('/', "-")
}

fn parse_record_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(RECORD_PREFIX)?
        .strip_prefix('_')?
        .strip_suffix(RECORD_SUFFIX)?
        .parse()
        .ok()
}

/// Scalar value to its inline JSON form, checked against the channel kind.
fn scalar_to_json(kind: &Kind, value: &Value) -> Result<serde_json::Value> {
    let ok = matches!(
        (kind, value),
        (_, Value::Null)
            | (Kind::Int, Value::Int(_))
            | (Kind::Float, Value::Float(_) | Value::Int(_))
            | (Kind::Str, Value::Str(_))
            | (Kind::Boolean, Value::Bool(_))
    );
    if !ok {
        return Err(TubError::TypeMismatch {
            kind: kind.name().to_string(),
            actual: value.type_name().to_string(),
        });
    }
    match (kind, value) {
        (Kind::Float, Value::Int(i)) => Value::Float(*i as f64).to_json(),
        _ => value.to_json(),
    }
}

fn scalar_from_json(kind: Option<&Kind>, json: serde_json::Value) -> Value {
    match (kind, &json) {
        (Some(Kind::Float), serde_json::Value::Number(n)) => {
            Value::Float(n.as_f64().unwrap_or(f64::NAN))
        }
        _ => Value::from_json(json),
    }
}

impl Tub {
    /// Open the tub at `path`, or create it when it does not exist and a
    /// schema is given.
    pub fn new(path: impl AsRef<Path>, schema: Option<&Schema>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else if let Some(schema) = schema {
            Self::create(path, schema)
        } else {
            Err(TubError::MissingSchema(path.display().to_string()))
        }
    }

    /// Open an existing tub and continue numbering after its highest id.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TubError::MissingSchema(path.display().to_string()));
        }
        let path = fs::canonicalize(path)?;
        let meta = TubMeta::load(path.join(META_FILE))?;
        let schema = meta.schema()?;
        let mut tub = Self {
            path,
            meta,
            schema,
            current_ix: 0,
            table: None,
        };
        let ids = tub.list_ids()?;
        tub.current_ix = ids.last().map_or(0, |last| last + 1);
        info!(
            tub = %tub.path.display(),
            records = ids.len(),
            next_ix = tub.current_ix,
            "opened tub"
        );
        Ok(tub)
    }

    /// Create a tub. If the directory already holds a tub, it is opened
    /// instead, and its metadata must match `schema`.
    pub fn create(path: impl AsRef<Path>, schema: &Schema) -> Result<Self> {
        let path = path.as_ref();
        let meta = TubMeta::from_schema(schema);
        if path.join(META_FILE).exists() {
            let tub = Self::open(path)?;
            if tub.meta != meta {
                return Err(TubError::SchemaMismatch(format!(
                    "tub at {} has inputs {:?} / types {:?}",
                    tub.path.display(),
                    tub.meta.inputs,
                    tub.meta.types
                )));
            }
            return Ok(tub);
        }
        fs::create_dir_all(path)?;
        let path = fs::canonicalize(path)?;
        meta.save(path.join(META_FILE))?;
        info!(tub = %path.display(), channels = schema.len(), "created tub");
        Ok(Self {
            path,
            meta,
            schema: schema.clone(),
            current_ix: 0,
            table: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &TubMeta {
        &self.meta
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn types(&self) -> Vec<Kind> {
        self.schema.types()
    }

    /// The id the most recent write used (or the reopen base).
    pub fn current_ix(&self) -> u64 {
        self.current_ix
    }

    pub fn record_path(&self, ix: u64) -> PathBuf {
        self.path.join(record_file_name(ix))
    }

    /// Persist one record and return its id. Type or encoding problems with
    /// a value drop the record with a warning and return `Ok(None)`.
    pub fn write(&mut self, values: &Record) -> Result<Option<u64>> {
        for key in values.keys() {
            let kind = self
                .schema
                .kind_of(key)
                .ok_or_else(|| TubError::UnknownChannel(key.clone()))?;
            if !kind.is_scalar() && !kind.is_image() {
                return Err(TubError::UnsupportedKind {
                    channel: key.clone(),
                    kind: kind.name().to_string(),
                });
            }
        }

        self.current_ix += 1;
        let ix = self.current_ix;
        self.table = None;

        // Encode every value before the first artifact is saved.
        let mut doc = serde_json::Map::new();
        let mut artifacts = Vec::new();
        for (key, value) in values {
            let Some(kind) = self.schema.kind_of(key) else {
                continue;
            };
            if kind.is_scalar() {
                match scalar_to_json(kind, value) {
                    Ok(json) => {
                        doc.insert(key.clone(), json);
                    }
                    Err(e) => {
                        warn!(tub = %self.path.display(), ix, channel = %key, error = %e, "dropping record");
                        return Ok(None);
                    }
                }
                continue;
            }
            let Value::Image(img) = value else {
                warn!(
                    tub = %self.path.display(),
                    ix,
                    channel = %key,
                    actual = value.type_name(),
                    "dropping record: image channel without image value"
                );
                return Ok(None);
            };
            let ext = if *kind == Kind::Image { "png" } else { "jpg" };
            artifacts.push((key, img, artifact_file_name(ix, key, ext)));
        }

        for (key, img, name) in artifacts {
            img.save(self.path.join(&name))?;
            doc.insert(key.clone(), serde_json::Value::String(name));
        }

        let bytes = serde_json::to_vec(&serde_json::Value::Object(doc))?;
        let mut file = fs::File::create(self.record_path(ix))?;
        file.write_all(&bytes)?;
        debug!(tub = %self.path.display(), ix, "wrote record");
        Ok(Some(ix))
    }

    fn load_document(&self, ix: u64) -> Result<serde_json::Map<String, serde_json::Value>> {
        let path = self.record_path(ix);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TubError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let corrupt = |reason: String| TubError::CorruptRecord { id: ix, reason };
        let text = String::from_utf8(bytes).map_err(|e| corrupt(e.to_string()))?;
        match serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(corrupt(format!("expected a JSON object, got {other}"))),
        }
    }

    /// Scan the directory for record files.
    pub fn scan_index(&self) -> Result<IndexScan> {
        let mut scan = IndexScan::default();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(RECORD_PREFIX) {
                continue;
            }
            match parse_record_id(&name) {
                Some(ix) => scan.ids.push(ix),
                None => {
                    warn!(tub = %self.path.display(), file = %name, "skipping malformed record file name");
                    scan.malformed.push(name);
                }
            }
        }
        scan.ids.sort_unstable();
        Ok(scan)
    }

    /// Record ids, ascending.
    pub fn list_ids(&self) -> Result<Vec<u64>> {
        Ok(self.scan_index()?.ids)
    }

    /// Record ids in an order drawn from `rng`.
    pub fn list_ids_shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<u64>> {
        let mut ids = self.list_ids()?;
        ids.shuffle(rng);
        Ok(ids)
    }

    /// Count of `record_*.json` files, recomputed on every call.
    pub fn count(&self) -> Result<usize> {
        let mut n = 0;
        for entry in fs::read_dir(&self.path)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("record_") && name.ends_with(RECORD_SUFFIX) {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Try to load every record. Failures are reported; with `fix` the
    /// offending record files are deleted.
    pub fn check(&mut self, fix: bool) -> Result<CheckReport> {
        let ids = self.list_ids()?;
        info!(tub = %self.path.display(), records = ids.len(), "checking tub");
        let mut report = CheckReport {
            total: ids.len(),
            ..CheckReport::default()
        };
        for ix in ids {
            let Err(e) = self.read(ix) else { continue };
            if fix {
                warn!(tub = %self.path.display(), ix, error = %e, "problem with record, removing");
                self.remove(ix)?;
                report.removed.push(ix);
            } else {
                warn!(tub = %self.path.display(), ix, error = %e, "problem with record");
            }
            report.problems.push((ix, e.to_string()));
        }
        if report.is_clean() {
            info!(tub = %self.path.display(), "no problems found");
        }
        Ok(report)
    }

    /// Delete a record document. Its artifacts stay on disk.
    pub fn remove(&mut self, ix: u64) -> Result<()> {
        let path = self.record_path(ix);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TubError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        self.table = None;
        debug!(tub = %self.path.display(), ix, "removed record");
        Ok(())
    }

    /// Rebuild the in-memory table from every record on disk.
    pub fn materialize_index(&mut self) -> Result<Arc<Table>> {
        let ids = self.list_ids()?;
        let this = &*self;
        let rows: Vec<Record> = ids
            .par_iter()
            .map(|&ix| this.read_raw(ix))
            .collect::<Result<_>>()?;
        let kinds: BTreeMap<String, Kind> = self
            .schema
            .channels()
            .iter()
            .map(|c| (c.name.clone(), c.kind.clone()))
            .collect();
        let table = Arc::new(Table::with_columns(self.schema.inputs(), kinds, rows));
        info!(tub = %self.path.display(), rows = table.len(), "materialized table");
        self.table = Some(Arc::clone(&table));
        Ok(table)
    }

    /// The cached table, built on first use and after any mutation.
    pub fn table(&mut self) -> Result<Arc<Table>> {
        match &self.table {
            Some(table) => Ok(Arc::clone(table)),
            None => self.materialize_index(),
        }
    }

    /// Whether a cached table is currently held.
    pub fn has_cached_table(&self) -> bool {
        self.table.is_some()
    }
}

impl RecordSource for Tub {
    fn read(&self, ix: u64) -> Result<Record> {
        let mut record = self.read_raw(ix)?;
        for (key, value) in record.iter_mut() {
            if self.schema.kind_of(key) != Some(&Kind::ImageArray) {
                continue;
            }
            if let Value::Str(path) = value {
                *value = Value::Image(ImageArray::open(path.as_str())?);
            }
        }
        Ok(record)
    }

    fn read_raw(&self, ix: u64) -> Result<Record> {
        let doc = self.load_document(ix)?;
        Ok(doc
            .into_iter()
            .map(|(key, json)| {
                let kind = self.schema.kind_of(&key);
                let value = match (kind, json) {
                    (Some(k), serde_json::Value::String(name)) if k.is_image() => {
                        Value::Str(self.path.join(name).to_string_lossy().into_owned())
                    }
                    (kind, json) => scalar_from_json(kind, json),
                };
                (key, value)
            })
            .collect())
    }

    fn kind_of(&self, channel: &str) -> Option<Kind> {
        self.schema.kind_of(channel).cloned()
    }
}

impl RecordStore for Tub {
    fn write_record(&mut self, values: &Record) -> Result<Option<u64>> {
        self.write(values)
    }

    fn write_values(&mut self, values: Vec<Value>) -> Result<Option<u64>> {
        let inputs = self.schema.inputs();
        if inputs.len() != values.len() {
            return Err(TubError::InvalidConfiguration(format!(
                "{} values for {} inputs",
                values.len(),
                inputs.len()
            )));
        }
        let record: Record = inputs.into_iter().zip(values).collect();
        self.write(&record)
    }

    fn count(&self) -> Result<usize> {
        Tub::count(self)
    }

    fn inputs(&self) -> Vec<String> {
        self.schema.inputs()
    }

    fn shutdown(self) -> Result<()> {
        Ok(())
    }

    fn delete(self) -> Result<()> {
        fs::remove_dir_all(&self.path)?;
        info!(tub = %self.path.display(), "deleted tub");
        Ok(())
    }
}
