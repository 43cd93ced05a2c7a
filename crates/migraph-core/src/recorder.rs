//! Applied-set persistence.
//!
//! The graph engine reads the applied set once per build and never writes
//! it; recording happens after the executor runs each plan step. The trait
//! keeps the engine independent of where the set lives.

use crate::error::Error;
use crate::key::MigrationKey;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Store of applied migration keys.
pub trait MigrationRecorder {
    /// Snapshot of the applied set.
    fn applied(&self) -> Result<BTreeSet<MigrationKey>, Error>;

    /// Record a migration as applied.
    fn record_applied(&mut self, key: &MigrationKey) -> Result<(), Error>;

    /// Record a migration as no longer applied.
    fn record_unapplied(&mut self, key: &MigrationKey) -> Result<(), Error>;
}

/// In-memory recorder, mostly for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    applied: BTreeSet<MigrationKey>,
}

impl MemoryRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder pre-seeded with applied keys.
    pub fn from_keys(keys: impl IntoIterator<Item = MigrationKey>) -> Self {
        Self {
            applied: keys.into_iter().collect(),
        }
    }
}

impl MigrationRecorder for MemoryRecorder {
    fn applied(&self) -> Result<BTreeSet<MigrationKey>, Error> {
        Ok(self.applied.clone())
    }

    fn record_applied(&mut self, key: &MigrationKey) -> Result<(), Error> {
        self.applied.insert(key.clone());
        Ok(())
    }

    fn record_unapplied(&mut self, key: &MigrationKey) -> Result<(), Error> {
        self.applied.remove(key);
        Ok(())
    }
}

/// Recorder backed by a JSON file holding the array of applied keys.
///
/// Every mutation rewrites the file; the applied set is small and the
/// simplicity beats a partial-update scheme.
#[derive(Debug, Clone)]
pub struct JsonRecorder {
    path: PathBuf,
}

impl JsonRecorder {
    /// Recorder reading and writing `path`. A missing file reads as an
    /// empty applied set.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<BTreeSet<MigrationKey>, Error> {
        if !self.path.exists() {
            return Ok(BTreeSet::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|source| Error::InvalidUnit {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, applied: &BTreeSet<MigrationKey>) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(applied)?;
        fs::write(&self.path, body)?;
        Ok(())
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MigrationRecorder for JsonRecorder {
    fn applied(&self) -> Result<BTreeSet<MigrationKey>, Error> {
        self.load()
    }

    fn record_applied(&mut self, key: &MigrationKey) -> Result<(), Error> {
        let mut applied = self.load()?;
        applied.insert(key.clone());
        self.store(&applied)
    }

    fn record_unapplied(&mut self, key: &MigrationKey) -> Result<(), Error> {
        let mut applied = self.load()?;
        applied.remove(key);
        self.store(&applied)
    }
}
