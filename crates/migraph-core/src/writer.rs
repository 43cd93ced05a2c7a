//! Serialization of collected units to the pending-migrations directory.
//!
//! The output directory is replaced wholesale: a previous run's files are
//! deleted first, and any failure mid-write removes the partial output
//! before the error propagates. Readers never observe a mix of old and new
//! files.

use crate::collect::CollectedUnits;
use crate::error::Error;
use crate::unit::UnitDef;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Write collected units as `<app>_<name>.json` files under `dir`.
///
/// Returns the written paths in deterministic order.
pub fn write_collected(dir: &Path, units: &CollectedUnits) -> Result<Vec<PathBuf>, Error> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;

    match write_units(dir, units) {
        Ok(paths) => {
            debug!(dir = %dir.display(), files = paths.len(), "collected migrations written");
            Ok(paths)
        }
        Err(err) => {
            // Leave no partial artifact behind.
            let _ = fs::remove_dir_all(dir);
            Err(err)
        }
    }
}

fn write_units(dir: &Path, units: &CollectedUnits) -> Result<Vec<PathBuf>, Error> {
    let mut paths = Vec::new();
    for (app, app_units) in units {
        for unit in app_units {
            let path = dir.join(format!("{}_{}.json", app, unit.key.name));
            let def = UnitDef::from(unit);
            let body = serde_json::to_string_pretty(&def)?;
            fs::write(&path, body)?;
            paths.push(path);
        }
    }
    Ok(paths)
}
