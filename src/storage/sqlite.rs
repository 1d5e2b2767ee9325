//! SQLite storage backend: one row per record in an embedded database.
//!
//! Every channel becomes a column of the `records` table, typed by the
//! storage tag its codec declares. Channel names are arbitrary user text, so
//! they are always quoted as identifiers; values are always bound.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::codec::{CodecRegistry, StorageTag, Stored};
use crate::errors::{Result, TubError};
use crate::schema::Schema;
use crate::storage::{RecordSource, RecordStore};
use crate::value::{Kind, Record, Value};

/// Bookkeeping columns every `records` row carries ahead of the channels.
pub const SYSTEM_COLUMNS: [&str; 3] = ["id", "timestamp", "active"];

/// Quote `name` as an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl ToSql for Stored {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Stored::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Stored::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Stored::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Stored::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn stored_from_ref(value: ValueRef<'_>) -> Option<Stored> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(Stored::Integer(i)),
        ValueRef::Real(f) => Some(Stored::Real(f)),
        ValueRef::Text(t) => Some(Stored::Text(String::from_utf8_lossy(t).into_owned())),
        ValueRef::Blob(b) => Some(Stored::Blob(b.to_vec())),
    }
}

/// Snapshot of the database state, suitable for logging or JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub records_columns: Vec<String>,
    pub records_total: usize,
    pub last_record_id: u64,
    pub records_active: usize,
}

/// SQLite-backed record store.
pub struct SqliteTub {
    conn: Connection,
    path: Option<PathBuf>,
    schema: Schema,
    registry: Arc<CodecRegistry>,
    last_rowid: Option<u64>,
}

impl SqliteTub {
    /// Open (or create) a database file with the given schema.
    pub fn open(
        path: impl AsRef<Path>,
        schema: &Schema,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, Some(path.to_path_buf()), schema, registry)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory(schema: &Schema, registry: Arc<CodecRegistry>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None, schema, registry)
    }

    fn init(
        conn: Connection,
        path: Option<PathBuf>,
        schema: &Schema,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self> {
        let tags: Vec<StorageTag> = schema
            .channels()
            .iter()
            .map(|c| registry.storage_tag(c.kind.name()))
            .collect::<Result<_>>()?;
        let columns: String = schema
            .channels()
            .iter()
            .zip(&tags)
            .map(|(c, tag)| format!(",\n                {} {}", quote_ident(&c.name), tag.as_sql()))
            .collect();

        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS channel (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT
            );

            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TIMESTAMP DEFAULT(STRFTIME('%Y-%m-%d %H:%M:%f', 'NOW')),
                active INTEGER DEFAULT 1{columns}
            );
            "
        ))?;

        let registered = {
            let mut stmt = conn.prepare("SELECT name, type FROM channel ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get::<_, Option<String>>(1)?.unwrap_or_default()))
            })?;
            let registered: Vec<(String, String)> = rows.collect::<rusqlite::Result<_>>()?;
            registered
        };
        if registered.is_empty() {
            for c in schema.channels() {
                conn.execute(
                    "INSERT INTO channel (name, type) VALUES (?1, ?2)",
                    params![c.name, c.kind.name()],
                )?;
            }
        } else {
            let same = registered.len() == schema.len()
                && registered
                    .iter()
                    .zip(schema.channels())
                    .all(|((name, kind), c)| *name == c.name && Kind::parse(kind) == c.kind);
            if !same {
                return Err(TubError::SchemaMismatch(format!(
                    "database has channels {:?}",
                    registered.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>()
                )));
            }
        }

        info!(
            db = %path.as_deref().map_or_else(|| ":memory:".into(), |p| p.display().to_string()),
            channels = schema.len(),
            "opened sqlite tub"
        );
        Ok(Self {
            conn,
            path,
            schema: schema.clone(),
            registry,
            last_rowid: None,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn column_list<S: AsRef<str>>(names: &[S]) -> String {
        SYSTEM_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(names.iter().map(|n| quote_ident(n.as_ref())))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Insert one row, values in schema order. `Value::Null` binds NULL.
    pub fn write(&mut self, values: &[Value]) -> Result<u64> {
        if values.len() != self.schema.len() {
            return Err(TubError::InvalidConfiguration(format!(
                "{} values for {} channels",
                values.len(),
                self.schema.len()
            )));
        }
        let stored: Vec<Option<Stored>> = self
            .schema
            .channels()
            .iter()
            .zip(values)
            .map(|(c, v)| match v {
                Value::Null => Ok(None),
                v => self.registry.encode(c.kind.name(), v).map(Some),
            })
            .collect::<Result<_>>()?;

        let sql = if stored.is_empty() {
            "INSERT INTO records DEFAULT VALUES".to_string()
        } else {
            let cols = self
                .schema
                .channels()
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=stored.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO records ({cols}) VALUES ({placeholders})")
        };
        self.conn.execute(&sql, params_from_iter(stored.iter()))?;
        let id = self.conn.last_insert_rowid() as u64;
        self.last_rowid = Some(id);
        debug!(id, "inserted record");
        Ok(id)
    }

    /// Insert one row by channel name. Absent channels are stored as NULL.
    pub fn write_record(&mut self, record: &Record) -> Result<u64> {
        if let Some(key) = record.keys().find(|k| self.schema.kind_of(k).is_none()) {
            return Err(TubError::UnknownChannel(key.clone()));
        }
        let values: Vec<Value> = self
            .schema
            .channels()
            .iter()
            .map(|c| record.get(&c.name).cloned().unwrap_or(Value::Null))
            .collect();
        self.write(&values)
    }

    fn decode_row<S: AsRef<str>>(&self, row: &Row<'_>, names: &[S]) -> Result<Record> {
        let mut record = Record::new();
        record.insert("id".into(), Value::Int(row.get(0)?));
        let timestamp = match stored_from_ref(row.get_ref(1)?) {
            Some(Stored::Text(t)) => Value::Str(t),
            Some(Stored::Integer(i)) => Value::Int(i),
            Some(Stored::Real(f)) => Value::Float(f),
            _ => Value::Null,
        };
        record.insert("timestamp".into(), timestamp);
        record.insert("active".into(), Value::Int(row.get(2)?));
        for (i, name) in names.iter().enumerate() {
            let name = name.as_ref();
            let kind = self
                .schema
                .kind_of(name)
                .ok_or_else(|| TubError::UnknownChannel(name.to_string()))?;
            let value = match stored_from_ref(row.get_ref(SYSTEM_COLUMNS.len() + i)?) {
                None => Value::Null,
                Some(stored) => self.registry.decode(kind.name(), &stored)?,
            };
            record.insert(name.to_string(), value);
        }
        Ok(record)
    }

    /// The `limit` most recent rows, newest first. `channels` restricts the
    /// decoded channels; `None` selects all of them.
    pub fn select_recent(&self, channels: Option<&[&str]>, limit: usize) -> Result<Vec<Record>> {
        let names: Vec<String> = match channels {
            Some(chs) => {
                for ch in chs {
                    if self.schema.kind_of(ch).is_none() {
                        return Err(TubError::UnknownChannel(ch.to_string()));
                    }
                }
                chs.iter().map(|c| c.to_string()).collect()
            }
            None => self.schema.inputs(),
        };
        let sql = format!(
            "SELECT {} FROM records ORDER BY id DESC LIMIT ?1",
            Self::column_list(&names)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(self.decode_row(row, &names)?);
        }
        Ok(out)
    }

    /// Soft-delete the window `(last_id - n, last_id]`. Returns rows touched.
    pub fn deactivate_window(&mut self, n: u64) -> Result<usize> {
        let last = self.last_id()?;
        let first = last.saturating_sub(n);
        let touched = self.conn.execute(
            "UPDATE records SET active = 0 WHERE id > ?1 AND id <= ?2",
            params![first as i64, last as i64],
        )?;
        info!(from = first + 1, to = last, touched, "deactivated records");
        Ok(touched)
    }

    /// Id of the last record written through this handle, or the highest
    /// stored id when nothing has been written yet.
    pub fn last_id(&self) -> Result<u64> {
        if let Some(id) = self.last_rowid {
            return Ok(id);
        }
        let max: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM records", [], |row| row.get(0))?;
        Ok(max as u64)
    }

    /// Total rows, active or not.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn active_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn summary(&self) -> Result<Summary> {
        let records_columns = {
            let stmt = self.conn.prepare("SELECT * FROM records LIMIT 0")?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            names
        };
        Ok(Summary {
            records_columns,
            records_total: self.count()?,
            last_record_id: self.last_id()?,
            records_active: self.active_count()?,
        })
    }

    fn close(self) -> Result<Option<PathBuf>> {
        let path = self.path;
        self.conn.close().map_err(|(_, e)| e)?;
        Ok(path)
    }
}

impl RecordSource for SqliteTub {
    fn read(&self, ix: u64) -> Result<Record> {
        let id = i64::try_from(ix).map_err(|_| TubError::NotFound(format!("record {ix}")))?;
        let names = self.schema.inputs();
        let sql = format!(
            "SELECT {} FROM records WHERE id = ?1",
            Self::column_list(&names)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => self.decode_row(row, &names),
            None => Err(TubError::NotFound(format!("record {ix}"))),
        }
    }

    fn kind_of(&self, channel: &str) -> Option<Kind> {
        self.schema.kind_of(channel).cloned()
    }
}

impl RecordStore for SqliteTub {
    fn write_record(&mut self, values: &Record) -> Result<Option<u64>> {
        SqliteTub::write_record(self, values).map(Some)
    }

    fn write_values(&mut self, values: Vec<Value>) -> Result<Option<u64>> {
        self.write(&values).map(Some)
    }

    fn count(&self) -> Result<usize> {
        SqliteTub::count(self)
    }

    fn inputs(&self) -> Vec<String> {
        self.schema.inputs()
    }

    fn shutdown(self) -> Result<()> {
        self.close()?;
        Ok(())
    }

    /// Close the connection and remove the database file with its WAL files.
    fn delete(self) -> Result<()> {
        let Some(path) = self.close()? else {
            return Ok(());
        };
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut name = path.as_os_str().to_owned();
            name.push(suffix);
            match fs::remove_file(PathBuf::from(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(db = %path.display(), "deleted sqlite tub");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecodeFn, EncodeFn};

    fn registry() -> Arc<CodecRegistry> {
        Arc::new(CodecRegistry::new())
    }

    fn angle_tub() -> SqliteTub {
        let schema = Schema::from_parts(&["angle"], &["float"]).unwrap();
        SqliteTub::in_memory(&schema, registry()).unwrap()
    }

    #[test]
    fn test_angle_scenario() {
        let mut db = angle_tub();
        let id = db.write(&[Value::Float(0.5)]).unwrap();
        assert_eq!(id, 1);

        let rec = db.read(1).unwrap();
        assert_eq!(rec["angle"], Value::Float(0.5));
        assert_eq!(rec["id"], Value::Int(1));
        assert_eq!(rec["active"], Value::Int(1));
        assert!(rec["timestamp"].as_str().is_some());

        let summary = db.summary().unwrap();
        assert_eq!(summary.records_total, 1);
        assert_eq!(summary.records_active, 1);
        assert_eq!(summary.last_record_id, 1);
        assert_eq!(summary.records_columns, vec!["id", "timestamp", "active", "angle"]);
    }

    #[test]
    fn test_fresh_store_has_no_last_id() {
        let schema = Schema::from_parts(&["angle", "throttle", "mode"], &["float", "float", "str"])
            .unwrap();
        let mut db = SqliteTub::in_memory(&schema, registry()).unwrap();
        assert_eq!(db.last_id().unwrap(), 0);
        let summary = db.summary().unwrap();
        assert_eq!(summary.records_total, 0);
        assert_eq!(summary.last_record_id, 0);

        assert_eq!(db.deactivate_window(2).unwrap(), 0);
        db.write(&[Value::Float(0.1), Value::Float(0.2), Value::Str("user".into())])
            .unwrap();
        assert_eq!(db.last_id().unwrap(), 1);
    }

    #[test]
    fn test_read_absent_row() {
        let db = angle_tub();
        assert!(db.read(42).unwrap_err().is_not_found());
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let names = ["user \"angle\"", "x); DROP TABLE records; --", "cam/mode"];
        let schema = Schema::from_parts(&names, &["float", "int", "str"]).unwrap();
        let mut db = SqliteTub::in_memory(&schema, registry()).unwrap();
        db.write(&[Value::Float(0.25), Value::Int(7), Value::Str("user".into())])
            .unwrap();

        let rec = db.read(1).unwrap();
        assert_eq!(rec[names[0]], Value::Float(0.25));
        assert_eq!(rec[names[1]], Value::Int(7));
        assert_eq!(rec[names[2]], Value::Str("user".into()));
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn test_deactivate_window() {
        let mut db = angle_tub();
        for i in 0..5 {
            db.write(&[Value::Float(i as f64)]).unwrap();
        }
        assert_eq!(db.deactivate_window(2).unwrap(), 2);
        assert_eq!(db.count().unwrap(), 5);
        assert_eq!(db.active_count().unwrap(), 3);
        assert_eq!(db.read(5).unwrap()["active"], Value::Int(0));
        assert_eq!(db.read(4).unwrap()["active"], Value::Int(0));
        assert_eq!(db.read(3).unwrap()["active"], Value::Int(1));

        // Window wider than the table stops at the first row.
        assert_eq!(db.deactivate_window(100).unwrap(), 5);
        assert_eq!(db.active_count().unwrap(), 0);
    }

    #[test]
    fn test_write_arity_and_unknown_channel() {
        let mut db = angle_tub();
        assert!(matches!(
            db.write(&[Value::Float(0.1), Value::Float(0.2)]),
            Err(TubError::InvalidConfiguration(_))
        ));
        let mut rec = Record::new();
        rec.insert("throttle".into(), Value::Float(0.3));
        assert!(matches!(db.write_record(&rec), Err(TubError::UnknownChannel(_))));
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_write_record_absent_channel_is_null() {
        let schema = Schema::from_parts(&["angle", "throttle"], &["float", "float"]).unwrap();
        let mut db = SqliteTub::in_memory(&schema, registry()).unwrap();
        let mut rec = Record::new();
        rec.insert("throttle".into(), Value::Float(0.3));
        let id = db.write_record(&rec).unwrap();
        let back = db.read(id).unwrap();
        assert_eq!(back["angle"], Value::Null);
        assert_eq!(back["throttle"], Value::Float(0.3));
    }

    #[test]
    fn test_select_recent() {
        let schema = Schema::from_parts(&["angle", "mode"], &["float", "str"]).unwrap();
        let mut db = SqliteTub::in_memory(&schema, registry()).unwrap();
        for i in 1..=5 {
            db.write(&[Value::Float(i as f64), Value::Str(format!("m{i}"))])
                .unwrap();
        }
        let recent = db.select_recent(Some(&["angle"]), 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0]["id"], Value::Int(5));
        assert_eq!(recent[1]["angle"], Value::Float(4.0));
        assert!(!recent[0].contains_key("mode"));

        assert_eq!(db.select_recent(None, 10).unwrap().len(), 5);
        assert!(db.select_recent(Some(&["nope"]), 1).is_err());
    }

    #[test]
    fn test_structured_and_boolean_kinds() {
        let schema = Schema::from_parts(&["pose", "recording"], &["dict", "boolean"]).unwrap();
        let mut db = SqliteTub::in_memory(&schema, registry()).unwrap();
        let mut pose = std::collections::BTreeMap::new();
        pose.insert("x".to_string(), Value::Float(1.5));
        pose.insert("tags".to_string(), Value::List(vec![Value::Str("a".into())]));
        db.write(&[Value::Map(pose.clone()), Value::Bool(true)]).unwrap();

        let rec = db.read(1).unwrap();
        assert_eq!(rec["pose"], Value::Map(pose));
        assert_eq!(rec["recording"], Value::Bool(true));
    }

    #[test]
    fn test_unknown_kind_rejected_at_open() {
        let schema = Schema::from_parts(&["cam"], &["image_array"]).unwrap();
        assert!(matches!(
            SqliteTub::in_memory(&schema, registry()),
            Err(TubError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_custom_kind() {
        let mut reg = CodecRegistry::new();
        let encode: EncodeFn = Arc::new(|v: &Value| -> Result<Stored> {
            Ok(Stored::Real(v.as_f64().unwrap_or_default() + 273.15))
        });
        let decode: DecodeFn = Arc::new(|s: &Stored| -> Result<Value> {
            match s {
                Stored::Real(k) => Ok(Value::Float(k - 273.15)),
                _ => Ok(Value::Null),
            }
        });
        reg.register("celsius", encode, decode, Some("real")).unwrap();

        let schema = Schema::from_parts(&["temp"], &["celsius"]).unwrap();
        let mut db = SqliteTub::in_memory(&schema, Arc::new(reg)).unwrap();
        db.write(&[Value::Float(20.0)]).unwrap();
        let t = db.read(1).unwrap()["temp"].as_f64().unwrap();
        assert!((t - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_reopen_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tub.db");
        let schema = Schema::from_parts(&["angle"], &["float"]).unwrap();

        let mut db = SqliteTub::open(&path, &schema, registry()).unwrap();
        for i in 0..3 {
            db.write(&[Value::Float(i as f64)]).unwrap();
        }
        db.shutdown().unwrap();

        let other = Schema::from_parts(&["throttle"], &["float"]).unwrap();
        assert!(matches!(
            SqliteTub::open(&path, &other, registry()),
            Err(TubError::SchemaMismatch(_))
        ));

        let mut db = SqliteTub::open(&path, &schema, registry()).unwrap();
        assert_eq!(db.count().unwrap(), 3);
        assert_eq!(db.last_id().unwrap(), 3);
        assert_eq!(db.deactivate_window(1).unwrap(), 1);
        assert_eq!(db.write(&[Value::Float(9.0)]).unwrap(), 4);

        db.delete().unwrap();
        assert!(!path.exists());
    }
}
