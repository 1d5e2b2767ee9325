//! Numbered tub directories under a common root.
//!
//! Each recording session gets a fresh sibling directory named
//! `tub_<NN>_<YY-MM-DD>`, numbered one past the highest existing tub.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::errors::Result;
use crate::schema::Schema;
use crate::storage::tub::Tub;

pub struct TubHandler {
    root: PathBuf,
}

fn tub_number(dir_name: &str) -> Option<u32> {
    let mut parts = dir_name.split('_');
    if parts.next()? != "tub" {
        return None;
    }
    parts.next()?.parse().ok()
}

impl TubHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sub-directories of the root, sorted by name. A missing root has none.
    pub fn list_tubs(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// One past the highest `tub_<NN>_*` number; directories that do not
    /// follow the pattern are ignored.
    pub fn next_tub_number(&self) -> Result<u32> {
        let max = self
            .list_tubs()?
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).and_then(tub_number))
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    pub fn create_tub_path(&self) -> Result<PathBuf> {
        let number = self.next_tub_number()?;
        let date = Local::now().format("%y-%m-%d");
        Ok(self.root.join(format!("tub_{number:02}_{date}")))
    }

    /// Create the next numbered tub with `schema`.
    pub fn new_tub_writer(&self, schema: &Schema) -> Result<Tub> {
        let path = self.create_tub_path()?;
        info!(tub = %path.display(), "starting new tub");
        Tub::create(path, schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tub_number_parse() {
        assert_eq!(tub_number("tub_07_24-05-01"), Some(7));
        assert_eq!(tub_number("tub_12"), Some(12));
        assert_eq!(tub_number("tub_x_24-05-01"), None);
        assert_eq!(tub_number("models"), None);
    }

    #[test]
    fn test_next_number_skips_other_dirs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["tub_01_24-01-01", "tub_07_24-02-02", "models", "tub_bad"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        fs::write(dir.path().join("tub_99_notes.txt"), b"").unwrap();

        let handler = TubHandler::new(dir.path());
        assert_eq!(handler.next_tub_number().unwrap(), 8);
        assert_eq!(handler.list_tubs().unwrap().len(), 4);
    }

    #[test]
    fn test_new_tub_writer() {
        let dir = tempfile::tempdir().unwrap();
        let handler = TubHandler::new(dir.path().join("data"));
        assert_eq!(handler.next_tub_number().unwrap(), 1);

        let schema = Schema::from_parts(&["angle"], &["float"]).unwrap();
        let tub = handler.new_tub_writer(&schema).unwrap();
        let name = tub.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tub_01_"));
        assert_eq!(name.len(), "tub_01_24-01-01".len());
        assert_eq!(tub.count().unwrap(), 0);

        let second = handler.new_tub_writer(&schema).unwrap();
        assert!(second
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tub_02_"));
    }
}
