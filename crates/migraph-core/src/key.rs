//! Migration identity keys.

use serde::{Deserialize, Serialize};

/// Identity of a migration unit: an `(app_label, name)` pair.
///
/// Keys order lexicographically by app, then name, which makes every
/// `BTreeMap`/`BTreeSet` of keys iterate in a stable, platform-independent
/// order. Serialized as a two-element array to match the on-disk unit
/// format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct MigrationKey {
    /// Label of the app the migration belongs to.
    pub app: String,
    /// Migration name, unique within the app.
    pub name: String,
}

impl MigrationKey {
    /// Sentinel name resolving to an app's root migration.
    pub const FIRST: &'static str = "__first__";
    /// Sentinel name resolving to an app's leaf migration.
    pub const LATEST: &'static str = "__latest__";

    /// Create a key from an app label and migration name.
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }

    /// Whether the name is one of the `__first__`/`__latest__` sentinels.
    pub fn is_sentinel(&self) -> bool {
        self.name == Self::FIRST || self.name == Self::LATEST
    }
}

impl std::fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.app, self.name)
    }
}

impl From<(String, String)> for MigrationKey {
    fn from((app, name): (String, String)) -> Self {
        Self { app, name }
    }
}

impl From<MigrationKey> for (String, String) {
    fn from(key: MigrationKey) -> Self {
        (key.app, key.name)
    }
}

impl From<(&str, &str)> for MigrationKey {
    fn from((app, name): (&str, &str)) -> Self {
        Self::new(app, name)
    }
}
