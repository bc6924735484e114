//! Relation persistence: an append-only file of length-prefixed records.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use mesh_core::relation::{decode_records, encode_record};
use mesh_core::{Relation, RelationStore, StoreError};
use parking_lot::Mutex;

pub struct FileRelationStore {
    path: PathBuf,
    /// Serializes appends from concurrent handshakes.
    write: Mutex<()>,
}

impl FileRelationStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write: Mutex::new(()),
        }
    }
}

impl RelationStore for FileRelationStore {
    fn load(&self) -> Result<Vec<Relation>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(decode_records(&bytes)?)
    }

    fn append(&self, relation: &Relation) -> Result<(), StoreError> {
        let record = encode_record(relation)?;
        let _guard = self.write.lock();
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&record)?;
        file.sync_data()?;
        tracing::debug!(mac = %relation.mac, path = %self.path.display(), "relation persisted");
        Ok(())
    }
}
