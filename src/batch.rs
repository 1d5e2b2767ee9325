//! Lazy batch pipeline over a materialized table.
//!
//! Sequences are endless iterators. Records are drawn from the table
//! (uniformly with replacement when shuffling, otherwise in repeated
//! in-order passes), run through an optional transform, then resolved so
//! `image_array` paths become pixels. Batches group a fixed number of
//! resolved records into one column per requested key.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::BatchConfig;
use crate::errors::{Result, TubError};
use crate::frame::ImageArray;
use crate::table::Table;
use crate::value::{Record, Value};

/// Applied to each raw row before artifacts are loaded.
pub type RecordTransform = Arc<dyn Fn(Record) -> Result<Record> + Send + Sync>;

/// One key's values across a batch, in record order.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub key: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Numeric values as `f64`. Booleans count as 0/1.
    pub fn as_f64(&self) -> Result<Vec<f64>> {
        self.values
            .iter()
            .map(|v| match v {
                Value::Bool(b) => Ok(f64::from(u8::from(*b))),
                v => v.as_f64().ok_or_else(|| TubError::TypeMismatch {
                    kind: "float".into(),
                    actual: v.type_name().into(),
                }),
            })
            .collect()
    }

    pub fn images(&self) -> Result<Vec<&ImageArray>> {
        self.values
            .iter()
            .map(|v| {
                v.as_image().ok_or_else(|| TubError::TypeMismatch {
                    kind: "image_array".into(),
                    actual: v.type_name().into(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub columns: Vec<Column>,
}

impl Batch {
    pub fn get(&self, key: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.key == key)
    }

    /// Records per column.
    pub fn size(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }
}

/// Endless stream of resolved records.
pub struct RecordSequence<R> {
    table: Arc<Table>,
    transform: Option<RecordTransform>,
    shuffle: bool,
    rng: R,
    cursor: usize,
}

impl<R: Rng> RecordSequence<R> {
    fn next_record(&mut self) -> Result<Record> {
        let len = self.table.len();
        let ix = if self.shuffle {
            self.rng.random_range(0..len)
        } else {
            let ix = self.cursor;
            self.cursor = (self.cursor + 1) % len;
            ix
        };
        let row = self.table.row(ix).cloned().ok_or(TubError::EmptyTable)?;
        let row = match &self.transform {
            Some(transform) => transform(row)?,
            None => row,
        };
        self.table.resolve(row)
    }
}

impl<R: Rng> Iterator for RecordSequence<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_record())
    }
}

/// Endless stream of keyed batches.
pub struct BatchSequence<R> {
    records: RecordSequence<R>,
    keys: Vec<String>,
    batch_size: usize,
}

impl<R: Rng> BatchSequence<R> {
    fn next_batch(&mut self) -> Result<Batch> {
        let mut columns: Vec<Column> = self
            .keys
            .iter()
            .map(|key| Column {
                key: key.clone(),
                values: Vec::with_capacity(self.batch_size),
            })
            .collect();
        for _ in 0..self.batch_size {
            let record = self.records.next_record()?;
            for column in &mut columns {
                let value = match record.get(&column.key) {
                    Some(value) => value.clone(),
                    // Partial record: the table has the column, this row does not.
                    None if self.records.table.columns().contains(&column.key) => Value::Null,
                    None => return Err(TubError::MissingColumn(column.key.clone())),
                };
                column.values.push(value);
            }
        }
        Ok(Batch { columns })
    }
}

impl<R: Rng> Iterator for BatchSequence<R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// Endless stream of `(X, Y)` column lists.
pub struct TrainSequence<R> {
    batches: BatchSequence<R>,
    n_x: usize,
}

impl<R: Rng> Iterator for TrainSequence<R> {
    type Item = Result<(Vec<Column>, Vec<Column>)>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.batches.next_batch().map(|batch| {
            let mut x = batch.columns;
            let y = x.split_off(self.n_x);
            (x, y)
        }))
    }
}

pub struct BatchGenerator {
    table: Arc<Table>,
    config: BatchConfig,
}

impl BatchGenerator {
    pub fn new(table: Arc<Table>) -> Self {
        Self::with_config(table, BatchConfig::default())
    }

    pub fn with_config(table: Arc<Table>, config: BatchConfig) -> Self {
        Self { table, config }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn record_sequence<R: Rng>(
        &self,
        transform: Option<RecordTransform>,
        shuffle: bool,
        rng: R,
    ) -> Result<RecordSequence<R>> {
        if self.table.is_empty() {
            return Err(TubError::EmptyTable);
        }
        Ok(RecordSequence {
            table: Arc::clone(&self.table),
            transform,
            shuffle,
            rng,
            cursor: 0,
        })
    }

    pub fn batch_sequence<R: Rng>(
        &self,
        keys: &[&str],
        transform: Option<RecordTransform>,
        batch_size: usize,
        shuffle: bool,
        rng: R,
    ) -> Result<BatchSequence<R>> {
        if batch_size == 0 {
            return Err(TubError::InvalidConfiguration(
                "batch_size must be positive".into(),
            ));
        }
        if keys.is_empty() {
            return Err(TubError::InvalidConfiguration(
                "at least one key is required".into(),
            ));
        }
        if self.table.is_empty() {
            return Err(TubError::EmptyTable);
        }
        // A transform may add keys; without one the table must have them.
        if transform.is_none() {
            let columns = self.table.columns();
            if let Some(missing) = keys
                .iter()
                .copied()
                .find(|k| !columns.iter().any(|c| c.as_str() == *k))
            {
                return Err(TubError::MissingColumn(missing.to_string()));
            }
        }
        debug!(?keys, batch_size, shuffle, rows = self.table.len(), "batch sequence");
        Ok(BatchSequence {
            records: self.record_sequence(transform, shuffle, rng)?,
            keys: keys.iter().map(|k| k.to_string()).collect(),
            batch_size,
        })
    }

    /// Batches split into input columns (`x_keys`) and target columns
    /// (`y_keys`). Sampling follows the configured `shuffle`.
    pub fn train_sequence<R: Rng>(
        &self,
        x_keys: &[&str],
        y_keys: &[&str],
        batch_size: usize,
        transform: Option<RecordTransform>,
        rng: R,
    ) -> Result<TrainSequence<R>> {
        let keys: Vec<&str> = x_keys.iter().chain(y_keys).copied().collect();
        Ok(TrainSequence {
            batches: self.batch_sequence(&keys, transform, batch_size, self.config.shuffle, rng)?,
            n_x: x_keys.len(),
        })
    }

    /// Partition the rows once into train and validation tables, then build
    /// one training sequence over each. Each sequence gets its own generator
    /// seeded from `rng`.
    pub fn train_val_split<R: Rng>(
        &self,
        x_keys: &[&str],
        y_keys: &[&str],
        batch_size: usize,
        transform: Option<RecordTransform>,
        train_fraction: f64,
        rng: &mut R,
    ) -> Result<(TrainSequence<StdRng>, TrainSequence<StdRng>)> {
        let (train, val) = self.table.split(train_fraction, rng)?;
        debug!(train = train.len(), val = val.len(), "split table");
        let train = Self::with_config(Arc::new(train), self.config.clone());
        let val = Self::with_config(Arc::new(val), self.config.clone());
        Ok((
            train.train_sequence(
                x_keys,
                y_keys,
                batch_size,
                transform.clone(),
                StdRng::seed_from_u64(rng.random()),
            )?,
            val.train_sequence(
                x_keys,
                y_keys,
                batch_size,
                transform,
                StdRng::seed_from_u64(rng.random()),
            )?,
        ))
    }

    /// [`Self::train_val_split`] with batch size, fraction and seed taken
    /// from the configuration.
    pub fn train_val_from_config(
        &self,
        x_keys: &[&str],
        y_keys: &[&str],
        transform: Option<RecordTransform>,
    ) -> Result<(TrainSequence<StdRng>, TrainSequence<StdRng>)> {
        self.config.validate()?;
        let mut rng = self.config.rng();
        self.train_val_split(
            x_keys,
            y_keys,
            self.config.batch_size,
            transform,
            self.config.train_fraction,
            &mut rng,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    use crate::schema::Schema;
    use crate::storage::tub::Tub;
    use crate::value::Kind;

    fn numbers(n: i64) -> Arc<Table> {
        let mut kinds = BTreeMap::new();
        kinds.insert("x".to_string(), Kind::Float);
        kinds.insert("y".to_string(), Kind::Int);
        let rows = (0..n)
            .map(|i| {
                let mut r = Record::new();
                r.insert("x".into(), Value::Float(i as f64));
                r.insert("y".into(), Value::Int(i));
                r
            })
            .collect();
        Arc::new(Table::new(kinds, rows))
    }

    fn in_order() -> BatchConfig {
        BatchConfig {
            shuffle: false,
            ..BatchConfig::default()
        }
    }

    #[test]
    fn test_batch_shape() {
        let generator = BatchGenerator::new(numbers(10));
        let mut batches = generator
            .batch_sequence(&["y", "x"], None, 4, true, StdRng::seed_from_u64(1))
            .unwrap();
        for _ in 0..3 {
            let batch = batches.next().unwrap().unwrap();
            assert_eq!(batch.columns.len(), 2);
            assert_eq!(batch.columns[0].key, "y");
            assert_eq!(batch.columns[1].key, "x");
            assert_eq!(batch.size(), 4);
            assert!(batch.columns.iter().all(|c| c.len() == 4));
            // Values stay aligned by record.
            let xs = batch.get("x").unwrap().as_f64().unwrap();
            let ys = batch.get("y").unwrap().as_f64().unwrap();
            assert_eq!(xs, ys);
        }
    }

    #[test]
    fn test_in_order_passes_wrap() {
        let generator = BatchGenerator::new(numbers(10));
        let mut batches = generator
            .batch_sequence(&["x"], None, 3, false, StdRng::seed_from_u64(0))
            .unwrap();
        let first = batches.next().unwrap().unwrap();
        assert_eq!(first.columns[0].as_f64().unwrap(), vec![0.0, 1.0, 2.0]);
        batches.next();
        batches.next();
        let fourth = batches.next().unwrap().unwrap();
        assert_eq!(fourth.columns[0].as_f64().unwrap(), vec![9.0, 0.0, 1.0]);
    }

    #[test]
    fn test_bad_arguments() {
        let generator = BatchGenerator::new(numbers(3));
        let rng = || StdRng::seed_from_u64(0);
        assert!(matches!(
            generator.batch_sequence(&["x"], None, 0, true, rng()),
            Err(TubError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            generator.batch_sequence(&[], None, 2, true, rng()),
            Err(TubError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            generator.batch_sequence(&["z"], None, 2, true, rng()),
            Err(TubError::MissingColumn(_))
        ));

        let empty = BatchGenerator::new(Arc::new(Table::default()));
        assert!(matches!(
            empty.record_sequence(None, true, rng()),
            Err(TubError::EmptyTable)
        ));
    }

    #[test]
    fn test_transform_runs_before_batching() {
        let generator = BatchGenerator::new(numbers(4));
        let transform: RecordTransform = Arc::new(|mut r: Record| -> Result<Record> {
            let x = r["x"].as_f64().unwrap_or_default();
            r.insert("x2".into(), Value::Float(x * 2.0));
            Ok(r)
        });
        let mut batches = generator
            .batch_sequence(&["x", "x2"], Some(transform), 4, false, StdRng::seed_from_u64(0))
            .unwrap();
        let batch = batches.next().unwrap().unwrap();
        assert_eq!(batch.get("x2").unwrap().as_f64().unwrap(), vec![0.0, 2.0, 4.0, 6.0]);

        let failing: RecordTransform = Arc::new(|_: Record| -> Result<Record> {
            Err(TubError::MissingColumn("x".into()))
        });
        let mut records = generator.record_sequence(Some(failing), false, StdRng::seed_from_u64(0)).unwrap();
        assert!(records.next().unwrap().is_err());
    }

    #[test]
    fn test_train_sequence_splits_columns() {
        let generator = BatchGenerator::new(numbers(6));
        let mut seq = generator
            .train_sequence(&["x"], &["y"], 5, None, StdRng::seed_from_u64(3))
            .unwrap();
        let (x, y) = seq.next().unwrap().unwrap();
        assert_eq!(x.len(), 1);
        assert_eq!(y.len(), 1);
        assert_eq!(x[0].key, "x");
        assert_eq!(y[0].key, "y");
        assert_eq!(x[0].as_f64().unwrap(), y[0].as_f64().unwrap());
    }

    #[test]
    fn test_train_val_split_is_disjoint() {
        let generator = BatchGenerator::with_config(numbers(10), in_order());
        let mut rng = StdRng::seed_from_u64(200);
        let (mut train, mut val) = generator
            .train_val_split(&["x"], &["y"], 8, None, 0.8, &mut rng)
            .unwrap();

        let (tx, _) = train.next().unwrap().unwrap();
        let (vx, _) = val.next().unwrap().unwrap();
        let seen_train: HashSet<i64> = tx[0].as_f64().unwrap().iter().map(|v| *v as i64).collect();
        let seen_val: HashSet<i64> = vx[0].as_f64().unwrap().iter().map(|v| *v as i64).collect();
        assert_eq!(seen_train.len(), 8);
        assert_eq!(seen_val.len(), 2);
        assert!(seen_train.is_disjoint(&seen_val));

        assert!(generator
            .train_val_split(&["x"], &["y"], 8, None, 1.0, &mut rng)
            .is_err());
    }

    #[test]
    fn test_train_val_from_config() {
        let config = BatchConfig {
            batch_size: 2,
            seed: Some(5),
            ..BatchConfig::default()
        };
        let generator = BatchGenerator::with_config(numbers(10), config);
        let (mut train, mut val) = generator.train_val_from_config(&["x"], &["y"], None).unwrap();
        assert_eq!(train.next().unwrap().unwrap().0[0].len(), 2);
        assert_eq!(val.next().unwrap().unwrap().1[0].len(), 2);
    }

    #[test]
    fn test_partial_record_fills_null() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::from_parts(&["angle", "throttle"], &["float", "float"]).unwrap();
        let mut tub = Tub::new(dir.path().join("tub"), Some(&schema)).unwrap();
        for i in 1..=4 {
            let mut rec = Record::new();
            rec.insert("angle".into(), Value::Float(i as f64));
            if i != 2 {
                rec.insert("throttle".into(), Value::Float(0.5));
            }
            tub.write(&rec).unwrap();
        }

        let generator = BatchGenerator::new(tub.table().unwrap());
        let mut batches = generator
            .batch_sequence(&["angle", "throttle"], None, 4, false, StdRng::seed_from_u64(0))
            .unwrap();
        let batch = batches.next().unwrap().unwrap();
        assert_eq!(batch.size(), 4);
        assert_eq!(batch.get("angle").unwrap().as_f64().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        let throttle = &batch.get("throttle").unwrap().values;
        assert_eq!(throttle.len(), 4);
        assert_eq!(throttle[1], Value::Null);
        assert_eq!(throttle[3], Value::Float(0.5));
    }

    #[test]
    fn test_images_resolved_from_tub() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::from_parts(&["cam", "angle"], &["image_array", "float"]).unwrap();
        let mut tub = Tub::new(dir.path().join("tub"), Some(&schema)).unwrap();
        for i in 0..3 {
            let mut rec = Record::new();
            rec.insert("cam".into(), Value::Image(ImageArray::solid_rgb(4, 4, [50, 100, 150])));
            rec.insert("angle".into(), Value::Float(i as f64));
            tub.write(&rec).unwrap();
        }

        let generator = BatchGenerator::new(tub.table().unwrap());
        let mut batches = generator
            .batch_sequence(&["cam", "angle"], None, 2, true, StdRng::seed_from_u64(9))
            .unwrap();
        let batch = batches.next().unwrap().unwrap();
        let images = batch.get("cam").unwrap().images().unwrap();
        assert_eq!(images.len(), 2);
        assert!(images.iter().all(|img| img.shape() == (4, 4, 3)));
        assert!(batch.get("cam").unwrap().as_f64().is_err());
        assert!(batch.get("angle").unwrap().images().is_err());
    }
}
