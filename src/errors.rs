//! Error types for the tub store.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TubError {
    #[error("Tub does not exist at {0} and no schema was given to create it")]
    MissingSchema(String),

    #[error("Unsupported kind '{kind}' for channel '{channel}'")]
    UnsupportedKind { channel: String, kind: String },

    #[error("Unknown kind: {0}")]
    UnknownKind(String),

    #[error("Kind '{0}' has no storage tag")]
    MissingStorageTag(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: u64, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Channel '{0}' is not declared in the schema")]
    UnknownChannel(String),

    #[error("Type mismatch for kind '{kind}': got {actual}")]
    TypeMismatch { kind: String, actual: String },

    #[error("Column '{0}' missing from record")]
    MissingColumn(String),

    #[error("Table has no rows")]
    EmptyTable,

    #[error("Wire format error: {0}")]
    Wire(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl TubError {
    /// True for errors that mean "the thing is not there", as opposed to broken.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TubError>;
