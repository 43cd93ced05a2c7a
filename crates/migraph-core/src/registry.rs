//! Migration unit discovery on disk.
//!
//! Units are declarative JSON files. Per-app layout is
//! `<root>/<app>/<name>.json`; project and pending directories are flat,
//! with filenames of the form `<app>_<name>.json` matched against the known
//! app labels (labels may themselves contain underscores, so the longest
//! matching label wins).

use crate::error::Error;
use crate::key::MigrationKey;
use crate::unit::{MigrationUnit, UnitDef};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Load per-app units from `<root>/<app>/<name>.json`.
///
/// With `ignore_missing`, an absent root yields an empty catalog instead of
/// [`Error::MissingDirectory`].
pub fn load_app_units(
    root: &Path,
    ignore_missing: bool,
) -> Result<BTreeMap<MigrationKey, MigrationUnit>, Error> {
    let mut units = BTreeMap::new();
    if !root.is_dir() {
        if ignore_missing {
            return Ok(units);
        }
        return Err(Error::MissingDirectory {
            path: root.to_path_buf(),
        });
    }

    for app in sorted_entries(root)? {
        let app_dir = root.join(&app);
        if !app_dir.is_dir() || skip_name(&app) {
            continue;
        }
        for name in sorted_entries(&app_dir)? {
            let path = app_dir.join(&name);
            let Some(stem) = json_stem(&name, &path) else {
                continue;
            };
            let unit = read_unit(&path, MigrationKey::new(&app, stem))?;
            units.insert(unit.key.clone(), unit);
        }
    }

    debug!(root = %root.display(), units = units.len(), "loaded app migrations");
    Ok(units)
}

/// Load units from a flat directory of `<app>_<name>.json` files.
///
/// Files whose name matches none of `known_apps` are skipped; an app label
/// that is a prefix of another (both followed by `_`) resolves to the longer
/// label.
pub fn load_flat_units(
    dir: &Path,
    known_apps: &BTreeSet<String>,
    ignore_missing: bool,
) -> Result<BTreeMap<MigrationKey, MigrationUnit>, Error> {
    let mut units = BTreeMap::new();
    if !dir.is_dir() {
        if ignore_missing {
            return Ok(units);
        }
        return Err(Error::MissingDirectory {
            path: dir.to_path_buf(),
        });
    }

    for file in sorted_entries(dir)? {
        let path = dir.join(&file);
        let Some(stem) = json_stem(&file, &path) else {
            continue;
        };
        let Some((app, name)) = split_app_label(stem, known_apps) else {
            debug!(file = %path.display(), "no app label matches, skipping");
            continue;
        };
        let unit = read_unit(&path, MigrationKey::new(app, name))?;
        units.insert(unit.key.clone(), unit);
    }

    debug!(dir = %dir.display(), units = units.len(), "loaded flat migrations");
    Ok(units)
}

/// Directory entry names in sorted order, for deterministic load order.
fn sorted_entries(dir: &Path) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Stem of a loadable `.json` file, or `None` for anything else.
fn json_stem<'a>(file_name: &'a str, path: &Path) -> Option<&'a str> {
    if !path.is_file() || skip_name(file_name) {
        return None;
    }
    file_name.strip_suffix(".json")
}

/// Editor droppings and private files stay out of the catalog.
fn skip_name(name: &str) -> bool {
    name.starts_with(['_', '.', '~'])
}

/// Split `<app>_<name>` against the known app labels, longest label first.
fn split_app_label<'a>(
    stem: &'a str,
    known_apps: &'a BTreeSet<String>,
) -> Option<(&'a str, &'a str)> {
    known_apps
        .iter()
        .filter_map(|app| {
            let rest = stem.strip_prefix(app.as_str())?.strip_prefix('_')?;
            if rest.is_empty() {
                return None;
            }
            Some((app.as_str(), rest))
        })
        .max_by_key(|(app, _)| app.len())
}

fn read_unit(path: &Path, key: MigrationKey) -> Result<MigrationUnit, Error> {
    let raw = fs::read_to_string(path)?;
    let def: UnitDef = serde_json::from_str(&raw).map_err(|source| Error::InvalidUnit {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(def.into_unit(key))
}
