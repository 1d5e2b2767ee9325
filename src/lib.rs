//! Tub store: an embedded record store for timestamped sensor samples.
//!
//! Records are maps from channel name to value, written one at a time while
//! a device runs and read back later as training batches. Two backends share
//! one contract ([`storage::RecordStore`]): a flat-file [`Tub`] (one JSON
//! document per record plus image side files) and an SQLite [`SqliteTub`].
//! Stores, tub groups and view transforms all produce a [`Table`], which a
//! [`BatchGenerator`] turns into endless keyed batches.

pub mod batch;
pub mod codec;
pub mod config;
pub mod errors;
pub mod frame;
pub mod group;
pub mod schema;
pub mod storage;
pub mod table;
pub mod value;
pub mod view;
pub mod wire;

pub use batch::{Batch, BatchGenerator, Column, RecordTransform};
pub use codec::{CodecRegistry, StorageTag, Stored};
pub use config::BatchConfig;
pub use errors::{Result, TubError};
pub use frame::ImageArray;
pub use group::TubGroup;
pub use schema::{Channel, Schema, TubMeta};
pub use storage::handler::TubHandler;
pub use storage::sqlite::{SqliteTub, Summary};
pub use storage::tub::{CheckReport, Tub};
pub use storage::{RecordSource, RecordStore};
pub use table::Table;
pub use value::{Kind, Record, Value};
pub use view::{ImageStacker, Stacked, TimeStacker};
